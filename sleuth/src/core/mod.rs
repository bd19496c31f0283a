//! Deterministic, pure logic for the investigation record.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod invariants;
pub mod session;
pub mod signature;
pub mod types;
