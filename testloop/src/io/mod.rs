//! Side-effecting adapters: processes, sandboxes, config, and run logs.

pub mod artifact;
pub mod command_capability;
pub mod config;
pub mod iteration_log;
pub mod process;
pub mod sandbox;
