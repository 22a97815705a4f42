//! Stable reason codes recorded in run state and the progress ledger.
//!
//! Downstream automation matches on these strings; never rename one.

pub const LOCK_TIMEOUT: &str = "ZCL_E_CAMPAIGN_LOCK_TIMEOUT";
pub const FLOW_FAILED: &str = "ZCL_E_CAMPAIGN_FLOW_FAILED";
pub const HOOK_FAILED: &str = "ZCL_E_CAMPAIGN_HOOK_FAILED";
pub const GLOBAL_TIMEOUT: &str = "ZCL_E_CAMPAIGN_GLOBAL_TIMEOUT";
pub const MISSION_TIMEOUT: &str = "ZCL_E_CAMPAIGN_MISSION_TIMEOUT";
pub const FIRST_MISSION_GATE_FAILED: &str = "ZCL_E_CAMPAIGN_FIRST_MISSION_GATE_FAILED";
pub const GATE_FAILED: &str = "ZCL_E_CAMPAIGN_GATE_FAILED";
pub const ABORTED: &str = "ZCL_E_CAMPAIGN_ABORTED";
pub const DUPLICATE_ATTEMPT: &str = "ZCL_E_CAMPAIGN_DUPLICATE_ATTEMPT";
pub const ATTEMPT_INVOCATION_FAILED: &str = "ZCL_E_CAMPAIGN_ATTEMPT_INVOCATION_FAILED";
pub const ATTEMPT_MISSING: &str = "ZCL_E_CAMPAIGN_ATTEMPT_MISSING";
pub const ATTEMPT_NOT_VALID: &str = "ZCL_E_CAMPAIGN_ATTEMPT_NOT_VALID";

/// Reason codes emitted by the process-based executor.
pub const SPAWN_FAILED: &str = "ZCL_E_SPAWN";
pub const ATTEMPT_TIMEOUT: &str = "ZCL_E_TIMEOUT";
pub const ATTEMPT_EXIT_NONZERO: &str = "ZCL_E_MISSION_EXIT_NONZERO";

/// Prefix reserved for reason codes produced by oracle / semantic evaluation.
pub const ORACLE_PREFIX: &str = "ZCL_E_ORACLE";

/// `_`-separated tokens that mark a reason code as infrastructure-class.
const INFRA_TOKENS: [&str; 6] = ["LOCK", "SPAWN", "IO", "TIMEOUT", "INFRA", "INVOCATION"];

/// True for lock/spawn/IO/timeout-class reason codes.
pub fn is_infra(code: &str) -> bool {
    code.split('_').any(|token| INFRA_TOKENS.contains(&token))
}

pub fn is_oracle(code: &str) -> bool {
    code.starts_with(ORACLE_PREFIX)
}

/// Dedupe and sort a reason-code list in place.
pub fn normalize(codes: &mut Vec<String>) {
    codes.retain(|code| !code.trim().is_empty());
    codes.sort();
    codes.dedup();
}
