//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod clean;
pub mod decision;
pub mod finalize;
pub mod keys;
pub mod parser;
pub mod store;
pub mod types;
