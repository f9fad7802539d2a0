//! Deterministic, pure logic shared by the sync engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take the current time as an argument where they need it,
//! and return deterministic outputs suitable for tests.

pub mod lifecycle;
pub mod line_buffer;
pub mod policy;
pub mod wire;
