//! Canonical ordering applied to snapshots before persistence.
//!
//! Sorting keeps written snapshots diffable and byte-stable: re-saving an
//! unchanged state produces identical bytes.

use crate::core::reason_codes;
use crate::core::types::{FlowRun, MissionGate, RunState};

/// Sort flows, attempts, and gates; dedupe and sort every reason-code list.
pub fn canonicalize_run_state(state: &mut RunState) {
    reason_codes::normalize(&mut state.reason_codes);

    for flow in &mut state.flows {
        canonicalize_flow_run(flow);
    }
    state
        .flows
        .sort_by(|left, right| left.flow_id.cmp(&right.flow_id));

    for gate in &mut state.mission_gates {
        canonicalize_gate(gate);
    }
    state.mission_gates.sort_by(|left, right| {
        (left.mission_index, &left.mission_id).cmp(&(right.mission_index, &right.mission_id))
    });
}

pub fn canonicalize_flow_run(flow: &mut FlowRun) {
    for attempt in &mut flow.attempts {
        reason_codes::normalize(&mut attempt.errors);
    }
    flow.attempts.sort_by(|left, right| {
        (left.mission_index, &left.mission_id, &left.attempt_id).cmp(&(
            right.mission_index,
            &right.mission_id,
            &right.attempt_id,
        ))
    });
}

pub fn canonicalize_gate(gate: &mut MissionGate) {
    reason_codes::normalize(&mut gate.reasons);
    for attempt in &mut gate.attempts {
        reason_codes::normalize(&mut attempt.reason_codes);
    }
    gate.attempts.sort_by(|left, right| {
        (&left.flow_id, &left.attempt_id).cmp(&(&right.flow_id, &right.attempt_id))
    });
}
