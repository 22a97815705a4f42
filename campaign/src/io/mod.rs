//! Side-effecting layer: filesystem, processes, and external collaborators.

pub mod atomic;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod evaluator;
pub mod executor;
pub mod hooks;
pub mod lock;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod progress;
pub mod run_state;
