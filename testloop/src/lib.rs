//! Orchestration engine for generating, running, and repairing test suites.
//!
//! A run feeds one source unit through a fixed pipeline of generation
//! capabilities (analyze, design, implement) and then a bounded refinement
//! loop that executes the tests in a sandbox, parses the results, and asks a
//! debugger capability for a revision until the tests pass or the iteration
//! budget runs out.
//!
//! - **[`core`]**: deterministic logic (state store, result parsing, loop
//!   decisions, finalization). No I/O.
//! - **[`io`]**: processes, sandboxes, config, and run logs.
//!
//! [`pipeline`], [`refine`], and [`workflow`] orchestrate capabilities over
//! the store. Capabilities are opaque behind [`capability::GenerationCapability`].

pub mod capability;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod refine;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
