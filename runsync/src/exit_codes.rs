//! Stable exit codes for the `runsync` CLI.
//!
//! When a user process runs to completion, `runsync` exits with that process's code.

/// The user process finished successfully.
pub const OK: i32 = 0;
/// Configuration, initialization, or launch failed before the user process ran.
pub const INVALID: i32 = 1;
/// An interrupt was received but the user process could not be confirmed stopped.
pub const UNKNOWN: i32 = 254;
/// The user process was stopped by an interrupt or a signal.
pub const KILLED: i32 = 255;
