//! Failure taxonomy for campaign runs.
//!
//! Every variant maps to a stable reason code. Callers classify failures with
//! `downcast_ref::<CampaignError>()` on an `anyhow::Error`; lock timeouts have a
//! dedicated predicate so they are never mistaken for ordinary I/O errors.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::reason_codes;

/// Lifecycle hook list a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    BeforeMission,
    AfterMission,
    OnFailure,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPhase::BeforeMission => "before_mission",
            HookPhase::AfterMission => "after_mission",
            HookPhase::OnFailure => "on_failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("flow '{flow_id}' failed during {stage}: {message}")]
    FlowFailed {
        flow_id: String,
        stage: &'static str,
        message: String,
    },

    #[error("{phase} hook `{command}` failed: {message}")]
    HookFailed {
        phase: HookPhase,
        command: String,
        message: String,
    },

    #[error("global deadline passed before mission {mission_index}")]
    GlobalTimeout { mission_index: u32 },

    #[error("mission {mission_index} exceeded its execution envelope")]
    MissionTimeout { mission_index: u32 },

    #[error("first mission {mission_index} failed its gate")]
    FirstMissionGateFailed { mission_index: u32 },

    #[error("{failed} mission gate(s) failed")]
    GateFailed { failed: usize },

    #[error("campaign aborted")]
    Aborted,
}

impl CampaignError {
    /// Stable reason code recorded in run state for this failure.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CampaignError::LockTimeout { .. } => reason_codes::LOCK_TIMEOUT,
            CampaignError::FlowFailed { .. } => reason_codes::FLOW_FAILED,
            CampaignError::HookFailed { .. } => reason_codes::HOOK_FAILED,
            CampaignError::GlobalTimeout { .. } => reason_codes::GLOBAL_TIMEOUT,
            CampaignError::MissionTimeout { .. } => reason_codes::MISSION_TIMEOUT,
            CampaignError::FirstMissionGateFailed { .. } => {
                reason_codes::FIRST_MISSION_GATE_FAILED
            }
            CampaignError::GateFailed { .. } => reason_codes::GATE_FAILED,
            CampaignError::Aborted => reason_codes::ABORTED,
        }
    }
}

/// True if `err` (or any error in its context chain) is a lock timeout.
pub fn is_lock_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<CampaignError>(),
            Some(CampaignError::LockTimeout { .. })
        )
    })
}
