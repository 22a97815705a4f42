//! Run-state invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::types::{Plan, RunState, SCHEMA_VERSION};

/// Check semantic invariants of a run-state snapshot:
/// - Supported `schemaVersion`
/// - Non-empty campaign and run ids
/// - `missionsCompleted` equals the number of recorded gates
/// - No duplicate flow ids or gate mission indexes
pub fn validate_run_state(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.schema_version != SCHEMA_VERSION {
        errors.push(format!(
            "unsupported schemaVersion {} (expected {})",
            state.schema_version, SCHEMA_VERSION
        ));
    }
    if state.campaign_id.trim().is_empty() {
        errors.push("campaignId must not be empty".to_string());
    }
    if state.run_id.trim().is_empty() {
        errors.push("runId must not be empty".to_string());
    }
    if state.missions_completed as usize != state.mission_gates.len() {
        errors.push(format!(
            "missionsCompleted {} does not match {} recorded gates",
            state.missions_completed,
            state.mission_gates.len()
        ));
    }

    let mut flow_ids = HashSet::new();
    for flow in &state.flows {
        if flow.flow_id.trim().is_empty() {
            errors.push("flowId must not be empty".to_string());
        }
        if !flow_ids.insert(flow.flow_id.as_str()) {
            errors.push(format!("duplicate flowId '{}'", flow.flow_id));
        }
    }

    let mut gate_indexes = HashSet::new();
    for gate in &state.mission_gates {
        if !gate_indexes.insert(gate.mission_index) {
            errors.push(format!(
                "duplicate gate for missionIndex {}",
                gate.mission_index
            ));
        }
    }

    errors
}

/// Check plan invariants: supported version, identity fields, unique mission indexes.
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.schema_version != SCHEMA_VERSION {
        errors.push(format!(
            "unsupported schemaVersion {} (expected {})",
            plan.schema_version, SCHEMA_VERSION
        ));
    }
    if plan.campaign_id.trim().is_empty() {
        errors.push("campaignId must not be empty".to_string());
    }
    if plan.spec_path.trim().is_empty() {
        errors.push("specPath must not be empty".to_string());
    }
    let mut seen = HashSet::new();
    for mission in &plan.missions {
        if !seen.insert(mission.mission_index) {
            errors.push(format!(
                "missionIndex {} appears more than once",
                mission.mission_index
            ));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FlowRun, MissionGate, PlanMission};
    use chrono::{TimeZone, Utc};

    fn state() -> RunState {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        RunState::new("camp", "run-1", "spec.toml", now)
    }

    #[test]
    fn valid_state_has_no_errors() {
        assert!(validate_run_state(&state()).is_empty());
    }

    #[test]
    fn reports_identity_and_version_errors() {
        let mut state = state();
        state.schema_version = 9;
        state.campaign_id = String::new();
        state.run_id = " ".to_string();

        let errors = validate_run_state(&state);
        assert!(errors.iter().any(|err| err.contains("schemaVersion")));
        assert!(errors.iter().any(|err| err.contains("campaignId")));
        assert!(errors.iter().any(|err| err.contains("runId")));
    }

    #[test]
    fn reports_duplicate_flows_and_gates() {
        let mut state = state();
        let flow = FlowRun {
            flow_id: "a".to_string(),
            runner_type: "process".to_string(),
            suite_file: String::new(),
            ok: true,
            attempts: Vec::new(),
        };
        state.flows = vec![flow.clone(), flow];
        let gate = MissionGate {
            mission_index: 1,
            mission_id: "m".to_string(),
            ok: true,
            reasons: Vec::new(),
            attempts: Vec::new(),
        };
        state.mission_gates = vec![gate.clone(), gate];
        state.missions_completed = 2;

        let errors = validate_run_state(&state);
        assert!(errors.iter().any(|err| err.contains("duplicate flowId")));
        assert!(errors.iter().any(|err| err.contains("duplicate gate")));
    }

    #[test]
    fn plan_rejects_duplicate_mission_index() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let plan = Plan {
            schema_version: SCHEMA_VERSION,
            campaign_id: "camp".to_string(),
            spec_path: "spec.toml".to_string(),
            created_at: now,
            missions: vec![PlanMission::new(0, "a"), PlanMission::new(0, "b")],
        };
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|err| err.contains("more than once")));
    }
}
