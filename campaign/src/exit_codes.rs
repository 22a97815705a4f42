//! Stable exit codes for `campaign` CLI commands.

/// Run finished and every mission gate passed (or the command succeeded).
pub const OK: i32 = 0;
/// Infrastructure abort: lock timeout, flow/evaluator failure, hook failure, bad input.
pub const ABORTED: i32 = 1;
/// Partial or invalid completion: gate failure, global or mission timeout, first-mission stop.
pub const INVALID: i32 = 2;
