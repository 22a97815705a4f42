//! Gate evaluation seam.

use anyhow::Result;

use crate::core::reason_codes;
use crate::core::state_update::gate_attempts;
use crate::core::types::{AttemptOutcome, FlowRun, MissionGate};
use crate::io::config::CampaignSpec;

/// Produces the verdict for one mission from every flow's result.
///
/// Called exactly once per mission, after all flows have returned.
pub trait GateEvaluator: Sync {
    fn evaluate(
        &self,
        spec: &CampaignSpec,
        mission_index: u32,
        mission_id: &str,
        flow_runs: &[FlowRun],
    ) -> Result<MissionGate>;
}

/// Passes a mission iff every configured flow produced attempts for it and all
/// of them are valid.
pub struct AllFlowsValidEvaluator;

impl GateEvaluator for AllFlowsValidEvaluator {
    fn evaluate(
        &self,
        spec: &CampaignSpec,
        mission_index: u32,
        mission_id: &str,
        flow_runs: &[FlowRun],
    ) -> Result<MissionGate> {
        let mut reasons = Vec::new();
        for flow in &spec.flows {
            let attempts: Vec<_> = flow_runs
                .iter()
                .filter(|run| run.flow_id == flow.flow_id)
                .flat_map(|run| &run.attempts)
                .filter(|attempt| attempt.mission_index == mission_index)
                .collect();
            if attempts.is_empty() {
                reasons.push(reason_codes::ATTEMPT_MISSING.to_string());
                continue;
            }
            for attempt in attempts
                .iter()
                .filter(|attempt| attempt.status != AttemptOutcome::Valid)
            {
                reasons.push(reason_codes::ATTEMPT_NOT_VALID.to_string());
                reasons.extend(attempt.errors.iter().cloned());
            }
        }
        reason_codes::normalize(&mut reasons);

        Ok(MissionGate {
            mission_index,
            mission_id: mission_id.to_string(),
            ok: reasons.is_empty(),
            reasons,
            attempts: gate_attempts(flow_runs, mission_index),
        })
    }
}
