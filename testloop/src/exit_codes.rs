//! Stable exit codes for `testloop` commands.

/// Command succeeded; for `run`, every generated test passed.
pub const OK: i32 = 0;
/// Invalid input, config, or a fatal engine error.
pub const FATAL: i32 = 1;
/// `testloop run` used its whole iteration budget with tests still failing.
pub const EXHAUSTED: i32 = 2;
