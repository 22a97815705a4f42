//! Deterministic, pure logic for the campaign state model.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! snapshots and return deterministic outputs suitable for tests.

pub mod canonical;
pub mod idempotency;
pub mod invariants;
pub mod reason_codes;
pub mod report;
pub mod selector;
pub mod state_update;
pub mod types;
