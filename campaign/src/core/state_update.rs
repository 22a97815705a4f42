//! Pure run-state transitions applied at engine checkpoints.

use std::collections::BTreeMap;

use crate::core::reason_codes;
use crate::core::types::{
    AttemptOutcome, AttemptStatus, FlowRun, GateAttempt, MissionGate, PlanMission, ProgressEvent,
    ProgressStatus, RunState, RunStatus,
};

/// Merge one mission's flow results into the run state.
///
/// Attempts for the same mission index replace earlier ones in the same flow, so a
/// resumed mission never leaves two attempt records behind.
pub fn merge_flow_runs(state: &mut RunState, mission_index: u32, results: &[FlowRun]) {
    for result in results {
        let position = state
            .flows
            .iter()
            .position(|flow| flow.flow_id == result.flow_id);
        let flow = match position {
            Some(position) => &mut state.flows[position],
            None => {
                state.flows.push(FlowRun {
                    flow_id: result.flow_id.clone(),
                    runner_type: result.runner_type.clone(),
                    suite_file: result.suite_file.clone(),
                    ok: true,
                    attempts: Vec::new(),
                });
                let last = state.flows.len() - 1;
                &mut state.flows[last]
            }
        };
        flow.runner_type = result.runner_type.clone();
        flow.suite_file = result.suite_file.clone();
        flow.attempts
            .retain(|attempt| attempt.mission_index != mission_index);
        flow.attempts.extend(
            result
                .attempts
                .iter()
                .filter(|attempt| attempt.mission_index == mission_index)
                .cloned(),
        );
        flow.refresh_ok();
    }
}

/// Insert or replace the gate for its mission and refresh the completion counter.
pub fn record_gate(state: &mut RunState, gate: MissionGate) {
    state
        .mission_gates
        .retain(|existing| existing.mission_index != gate.mission_index);
    state.mission_gates.push(gate);
    state.missions_completed = state.mission_gates.len() as u32;
}

/// `valid` iff every recorded gate passed.
pub fn final_status(state: &RunState) -> RunStatus {
    if state.mission_gates.iter().all(|gate| gate.ok) {
        RunStatus::Valid
    } else {
        RunStatus::Invalid
    }
}

/// Per-flow attempt summaries for one mission, as embedded in its gate.
pub fn gate_attempts(results: &[FlowRun], mission_index: u32) -> Vec<GateAttempt> {
    results
        .iter()
        .flat_map(|flow| {
            flow.attempts
                .iter()
                .filter(move |attempt| attempt.mission_index == mission_index)
                .map(move |attempt| GateAttempt {
                    flow_id: flow.flow_id.clone(),
                    attempt_id: attempt.attempt_id.clone(),
                    status: attempt.status,
                    reason_codes: attempt.errors.clone(),
                })
        })
        .collect()
}

/// Failed gate recorded when a mission envelope expires; the evaluator is not consulted.
pub fn timeout_gate(mission: &PlanMission, results: &[FlowRun]) -> MissionGate {
    MissionGate {
        mission_index: mission.mission_index,
        mission_id: mission.mission_id.clone(),
        ok: false,
        reasons: vec![reason_codes::MISSION_TIMEOUT.to_string()],
        attempts: gate_attempts(results, mission.mission_index),
    }
}

/// Mark every attempt of a flow that finished after the mission deadline.
pub fn mark_late(flow: &mut FlowRun) {
    for attempt in &mut flow.attempts {
        attempt.record_claim();
        attempt.status = AttemptOutcome::InfraFailed;
        attempt
            .errors
            .push(reason_codes::MISSION_TIMEOUT.to_string());
        reason_codes::normalize(&mut attempt.errors);
    }
    flow.refresh_ok();
}

/// Flow result standing in for an executor invocation that returned an error.
pub fn synthesized_failure(
    flow_id: &str,
    runner_type: &str,
    suite_file: &str,
    mission: &PlanMission,
    reason: &str,
) -> FlowRun {
    FlowRun {
        flow_id: flow_id.to_string(),
        runner_type: runner_type.to_string(),
        suite_file: suite_file.to_string(),
        ok: false,
        attempts: vec![AttemptStatus {
            mission_index: mission.mission_index,
            mission_id: mission.mission_id.clone(),
            attempt_id: format!("{flow_id}-{:03}-synthesized", mission.mission_index),
            attempt_dir: String::new(),
            status: AttemptOutcome::InfraFailed,
            errors: vec![reason.to_string()],
            claimed_status: None,
        }],
    }
}

/// Rebuild gates for missions the ledger marks completed but the snapshot lacks.
///
/// This happens when a run stopped after appending a gate event and before
/// persisting the snapshot. The latest gate event per mission wins; its attempt
/// summaries come from the same run's attempt events. Returns the number of
/// gates recovered.
pub fn recover_gates(state: &mut RunState, events: &[ProgressEvent]) -> usize {
    let mut latest: BTreeMap<u32, &ProgressEvent> = BTreeMap::new();
    for event in events.iter().filter(|event| event.status.is_terminal_gate()) {
        latest.insert(event.mission_index, event);
    }

    let mut recovered = 0;
    for (mission_index, gate_event) in latest {
        if state.gate_for(mission_index).is_some() {
            continue;
        }
        let attempts = events
            .iter()
            .filter(|event| {
                event.mission_index == mission_index && event.run_id == gate_event.run_id
            })
            .filter_map(|event| {
                Some(GateAttempt {
                    flow_id: event.flow_id.clone()?,
                    attempt_id: event.attempt_id.clone().unwrap_or_default(),
                    status: event.status.attempt_outcome()?,
                    reason_codes: event.reason_codes.clone(),
                })
            })
            .collect();
        record_gate(
            state,
            MissionGate {
                mission_index,
                mission_id: gate_event.mission_id.clone(),
                ok: gate_event.status == ProgressStatus::GatePass,
                reasons: gate_event.reason_codes.clone(),
                attempts,
            },
        );
        recovered += 1;
    }
    recovered
}

/// Move the state to a terminal status with the given reasons.
///
/// A state that is already terminal, or a non-terminal target, leaves the state
/// untouched and returns false.
pub fn finish(state: &mut RunState, status: RunStatus, reasons: &[&str]) -> bool {
    if state.status.is_terminal() || !status.is_terminal() {
        return false;
    }
    state.status = status;
    state
        .reason_codes
        .extend(reasons.iter().map(|reason| reason.to_string()));
    reason_codes::normalize(&mut state.reason_codes);
    true
}
