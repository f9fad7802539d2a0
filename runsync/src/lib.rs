//! Local run sync engine.
//!
//! Watches the directory an instrumented process writes its run into, decides per file how
//! and when it reaches the remote store, streams console output and append-only logs under
//! backpressure, and coordinates start, stop, exit code, and resume with the process that
//! owns the run.
//!
//! - **[`core`]**: Pure logic (line assembly, policy selection, lifecycle decisions, wire
//!   framing). No I/O.
//! - **[`io`]**: Side-effecting building blocks (remote store, upload queue, stream pushers,
//!   watcher, process control, wire sockets).
//!
//! [`policies`] and [`dispatcher`] route file changes to uploads; [`coordinator`] drives a
//! whole run.

pub mod context;
pub mod coordinator;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod policies;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
