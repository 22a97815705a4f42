//! Shared deterministic types for the campaign state model.
//!
//! These types define the persisted contracts between the engine, the plan
//! store, the progress ledger, and the report builder. Field names serialize in
//! camelCase so snapshots stay stable for downstream automation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for persisted snapshots (run state, plan).
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle status of one campaign run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Valid,
    Invalid,
    Aborted,
}

impl RunStatus {
    /// Terminal statuses are never mutated again by the engine.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Valid => "valid",
            RunStatus::Invalid => "invalid",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Outcome of one flow's attempt at one mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Valid,
    Invalid,
    Skipped,
    InfraFailed,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Valid => "valid",
            AttemptOutcome::Invalid => "invalid",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::InfraFailed => "infra_failed",
        }
    }
}

/// One mission selected for a campaign, in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMission {
    pub mission_index: u32,
    pub mission_id: String,
}

impl PlanMission {
    pub fn new(mission_index: u32, mission_id: impl Into<String>) -> Self {
        Self {
            mission_index,
            mission_id: mission_id.into(),
        }
    }
}

/// Persisted mission ordering for one spec path (`campaign.plan.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub schema_version: u32,
    pub campaign_id: String,
    pub spec_path: String,
    pub created_at: DateTime<Utc>,
    pub missions: Vec<PlanMission>,
}

/// Executor-reported status of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStatus {
    pub mission_index: u32,
    pub mission_id: String,
    pub attempt_id: String,
    #[serde(default)]
    pub attempt_dir: String,
    pub status: AttemptOutcome,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Status as the executor reported it, kept when the engine later demotes
    /// the attempt (duplicate or late).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_status: Option<AttemptOutcome>,
}

impl AttemptStatus {
    /// Remember the current status as the executor's claim, unless one is recorded.
    pub fn record_claim(&mut self) {
        if self.claimed_status.is_none() {
            self.claimed_status = Some(self.status);
        }
    }

    pub fn claimed(&self) -> AttemptOutcome {
        self.claimed_status.unwrap_or(self.status)
    }
}

/// Per-flow results for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub flow_id: String,
    pub runner_type: String,
    #[serde(default)]
    pub suite_file: String,
    pub ok: bool,
    #[serde(default)]
    pub attempts: Vec<AttemptStatus>,
}

impl FlowRun {
    /// Recompute the aggregate `ok` flag from the attempt list.
    pub fn refresh_ok(&mut self) {
        self.ok = self
            .attempts
            .iter()
            .all(|attempt| attempt.status == AttemptOutcome::Valid);
    }
}

/// Summary of one flow's attempt, embedded in a [`MissionGate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateAttempt {
    pub flow_id: String,
    pub attempt_id: String,
    pub status: AttemptOutcome,
    #[serde(default)]
    pub reason_codes: Vec<String>,
}

/// Verdict for one mission across all flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionGate {
    pub mission_index: u32,
    pub mission_id: String,
    pub ok: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub attempts: Vec<GateAttempt>,
}

/// Canonical mutable campaign record (`campaign.run.state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub schema_version: u32,
    pub campaign_id: String,
    pub run_id: String,
    #[serde(default)]
    pub spec_path: String,
    pub status: RunStatus,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_missions: u32,
    pub missions_completed: u32,
    pub mission_offset: u32,
    #[serde(default)]
    pub flows: Vec<FlowRun>,
    #[serde(default)]
    pub mission_gates: Vec<MissionGate>,
}

impl RunState {
    /// Fresh `running` state for a new run.
    pub fn new(
        campaign_id: impl Into<String>,
        run_id: impl Into<String>,
        spec_path: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            campaign_id: campaign_id.into(),
            run_id: run_id.into(),
            spec_path: spec_path.into(),
            status: RunStatus::Running,
            reason_codes: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            total_missions: 0,
            missions_completed: 0,
            mission_offset: 0,
            flows: Vec::new(),
            mission_gates: Vec::new(),
        }
    }

    pub fn gate_for(&self, mission_index: u32) -> Option<&MissionGate> {
        self.mission_gates
            .iter()
            .find(|gate| gate.mission_index == mission_index)
    }
}

/// Status recorded on a progress ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Valid,
    Invalid,
    Skipped,
    InfraFailed,
    GatePass,
    GateFail,
    WatchdogHeartbeat,
    MissionAborted,
}

impl ProgressStatus {
    /// Gate events mark a mission as completed on replay.
    pub fn is_terminal_gate(self) -> bool {
        matches!(self, ProgressStatus::GatePass | ProgressStatus::GateFail)
    }

    /// Attempt outcome carried by an attempt event; `None` for lifecycle events.
    pub fn attempt_outcome(self) -> Option<AttemptOutcome> {
        match self {
            ProgressStatus::Valid => Some(AttemptOutcome::Valid),
            ProgressStatus::Invalid => Some(AttemptOutcome::Invalid),
            ProgressStatus::Skipped => Some(AttemptOutcome::Skipped),
            ProgressStatus::InfraFailed => Some(AttemptOutcome::InfraFailed),
            ProgressStatus::GatePass
            | ProgressStatus::GateFail
            | ProgressStatus::WatchdogHeartbeat
            | ProgressStatus::MissionAborted => None,
        }
    }
}

impl From<AttemptOutcome> for ProgressStatus {
    fn from(outcome: AttemptOutcome) -> Self {
        match outcome {
            AttemptOutcome::Valid => ProgressStatus::Valid,
            AttemptOutcome::Invalid => ProgressStatus::Invalid,
            AttemptOutcome::Skipped => ProgressStatus::Skipped,
            AttemptOutcome::InfraFailed => ProgressStatus::InfraFailed,
        }
    }
}

/// One immutable fact appended to `campaign.progress.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(default)]
    pub run_id: String,
    pub mission_index: u32,
    pub mission_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_dir: Option<String>,
    pub status: ProgressStatus,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}
