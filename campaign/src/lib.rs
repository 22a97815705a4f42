//! Crash-recoverable campaign orchestration for coding-agent evaluation.
//!
//! A campaign runs many missions across one or more execution flows and keeps
//! an idempotent, resumable record of what happened. The crate keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state model, idempotency, mission
//!   selection, state transitions, reports). No I/O.
//! - **[`io`]**: Side-effecting operations (lock, plan store, progress ledger,
//!   snapshots, processes) and the collaborator seams the engine consumes.
//!
//! [`engine`] coordinates the two to implement `campaign run`.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
