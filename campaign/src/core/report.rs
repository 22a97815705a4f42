//! Report and summary views derived from a run-state snapshot.
//!
//! Both builders are pure: the same snapshot always yields the same view, with
//! map-backed fields ordered by key.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::reason_codes;
use crate::core::types::{AttemptOutcome, AttemptStatus, RunState, RunStatus};

/// Failure buckets for non-valid attempts. Each failed attempt lands in exactly one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureBuckets {
    pub infra: usize,
    pub oracle: usize,
    pub mission: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowReport {
    pub flow_id: String,
    pub runner_type: String,
    pub attempts: usize,
    pub valid: usize,
    pub invalid: usize,
    pub skipped: usize,
    pub infra_failed: usize,
    pub failures: FailureBuckets,
}

/// Aggregate pass/fail view of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub campaign_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub reason_codes: Vec<String>,
    pub flows: Vec<FlowReport>,
    pub failures: FailureBuckets,
    pub gates_passed: usize,
    pub gates_failed: usize,
}

/// Claimed-versus-verified view of one mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionSummary {
    pub mission_index: u32,
    pub mission_id: String,
    /// Every flow reported its attempt as valid.
    pub claimed_ok: bool,
    /// The gate passed.
    pub verified_ok: bool,
    pub mismatch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonCount {
    pub code: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub report: Report,
    pub missions: Vec<MissionSummary>,
    pub mismatches: usize,
    pub top_failure_codes: Vec<ReasonCount>,
}

/// Bucket for a non-valid attempt: infra takes precedence over oracle over mission.
pub fn classify_failure(attempt: &AttemptStatus) -> FailureBucket {
    if attempt.status == AttemptOutcome::InfraFailed
        || attempt.errors.iter().any(|code| reason_codes::is_infra(code))
    {
        return FailureBucket::Infra;
    }
    if attempt.errors.iter().any(|code| reason_codes::is_oracle(code)) {
        return FailureBucket::Oracle;
    }
    FailureBucket::Mission
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBucket {
    Infra,
    Oracle,
    Mission,
}

impl FailureBuckets {
    fn add(&mut self, bucket: FailureBucket) {
        match bucket {
            FailureBucket::Infra => self.infra += 1,
            FailureBucket::Oracle => self.oracle += 1,
            FailureBucket::Mission => self.mission += 1,
        }
    }

    fn merge(&mut self, other: FailureBuckets) {
        self.infra += other.infra;
        self.oracle += other.oracle;
        self.mission += other.mission;
    }
}

pub fn build_report(state: &RunState) -> Report {
    let mut flows = Vec::with_capacity(state.flows.len());
    let mut failures = FailureBuckets::default();

    for flow in &state.flows {
        let mut report = FlowReport {
            flow_id: flow.flow_id.clone(),
            runner_type: flow.runner_type.clone(),
            attempts: flow.attempts.len(),
            ..FlowReport::default()
        };
        for attempt in &flow.attempts {
            match attempt.status {
                AttemptOutcome::Valid => report.valid += 1,
                AttemptOutcome::Invalid => report.invalid += 1,
                AttemptOutcome::Skipped => report.skipped += 1,
                AttemptOutcome::InfraFailed => report.infra_failed += 1,
            }
            if matches!(
                attempt.status,
                AttemptOutcome::Invalid | AttemptOutcome::InfraFailed
            ) {
                report.failures.add(classify_failure(attempt));
            }
        }
        failures.merge(report.failures);
        flows.push(report);
    }
    flows.sort_by(|left, right| left.flow_id.cmp(&right.flow_id));

    let gates_passed = state.mission_gates.iter().filter(|gate| gate.ok).count();
    let gates_failed = state.mission_gates.len() - gates_passed;

    let mut reason_codes = state.reason_codes.clone();
    reason_codes::normalize(&mut reason_codes);

    Report {
        campaign_id: state.campaign_id.clone(),
        run_id: state.run_id.clone(),
        status: state.status,
        reason_codes,
        flows,
        failures,
        gates_passed,
        gates_failed,
    }
}

pub fn build_summary(state: &RunState) -> Summary {
    let report = build_report(state);

    let mut missions: Vec<MissionSummary> = state
        .mission_gates
        .iter()
        .map(|gate| {
            let claimed_ok = claimed_ok(state, gate.mission_index);
            MissionSummary {
                mission_index: gate.mission_index,
                mission_id: gate.mission_id.clone(),
                claimed_ok,
                verified_ok: gate.ok,
                mismatch: claimed_ok != gate.ok,
            }
        })
        .collect();
    missions.sort_by(|left, right| {
        (left.mission_index, &left.mission_id).cmp(&(right.mission_index, &right.mission_id))
    });
    let mismatches = missions.iter().filter(|mission| mission.mismatch).count();

    Summary {
        report,
        missions,
        mismatches,
        top_failure_codes: rank_failure_codes(state),
    }
}

/// True when every flow that ran the mission reported a valid attempt for it.
///
/// Reads the executor's own verdict, not the status after duplicate or late
/// demotion. A mission no flow reported on is not claimed.
fn claimed_ok(state: &RunState, mission_index: u32) -> bool {
    let mut seen = false;
    for flow in &state.flows {
        for attempt in flow
            .attempts
            .iter()
            .filter(|attempt| attempt.mission_index == mission_index)
        {
            seen = true;
            if attempt.claimed() != AttemptOutcome::Valid {
                return false;
            }
        }
    }
    seen
}

/// Failure reason codes by frequency, descending; ties broken lexicographically.
///
/// Counts the codes of every non-valid attempt plus the reasons of every failed gate.
fn rank_failure_codes(state: &RunState) -> Vec<ReasonCount> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for flow in &state.flows {
        for attempt in &flow.attempts {
            if attempt.status == AttemptOutcome::Valid {
                continue;
            }
            for code in &attempt.errors {
                *counts.entry(code.as_str()).or_default() += 1;
            }
        }
    }
    for gate in state.mission_gates.iter().filter(|gate| !gate.ok) {
        for code in &gate.reasons {
            *counts.entry(code.as_str()).or_default() += 1;
        }
    }

    let mut ranked: Vec<ReasonCount> = counts
        .into_iter()
        .map(|(code, count)| ReasonCount {
            code: code.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|left, right| {
        right
            .count
            .cmp(&left.count)
            .then_with(|| left.code.cmp(&right.code))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FlowRun, MissionGate};
    use chrono::{TimeZone, Utc};

    fn attempt(index: u32, status: AttemptOutcome, errors: &[&str]) -> AttemptStatus {
        AttemptStatus {
            mission_index: index,
            mission_id: format!("m{index}"),
            attempt_id: format!("att-{index}"),
            attempt_dir: String::new(),
            status,
            errors: errors.iter().map(|code| code.to_string()).collect(),
            claimed_status: None,
        }
    }

    fn gate(index: u32, ok: bool, reasons: &[&str]) -> MissionGate {
        MissionGate {
            mission_index: index,
            mission_id: format!("m{index}"),
            ok,
            reasons: reasons.iter().map(|code| code.to_string()).collect(),
            attempts: Vec::new(),
        }
    }

    fn sample_state() -> RunState {
        let mut state = RunState::new(
            "camp",
            "run-1",
            "spec",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        );
        state.status = RunStatus::Invalid;
        state.flows = vec![
            FlowRun {
                flow_id: "beta".to_string(),
                runner_type: "process".to_string(),
                suite_file: String::new(),
                ok: false,
                attempts: vec![
                    attempt(0, AttemptOutcome::Valid, &[]),
                    attempt(1, AttemptOutcome::Invalid, &["ZCL_E_ORACLE_ASSERT"]),
                    attempt(2, AttemptOutcome::Skipped, &[]),
                ],
            },
            FlowRun {
                flow_id: "alpha".to_string(),
                runner_type: "process".to_string(),
                suite_file: String::new(),
                ok: false,
                attempts: vec![
                    attempt(0, AttemptOutcome::Valid, &[]),
                    attempt(1, AttemptOutcome::InfraFailed, &[reason_codes::SPAWN_FAILED]),
                    attempt(2, AttemptOutcome::Invalid, &["ZCL_E_MISSION_EXIT_NONZERO"]),
                ],
            },
        ];
        state.mission_gates = vec![
            gate(0, false, &["ZCL_E_ORACLE_ASSERT"]),
            gate(1, false, &[reason_codes::ATTEMPT_NOT_VALID]),
            gate(2, false, &[reason_codes::ATTEMPT_NOT_VALID]),
        ];
        state.missions_completed = 3;
        state
    }

    #[test]
    fn report_counts_statuses_and_buckets() {
        let report = build_report(&sample_state());

        assert_eq!(report.flows[0].flow_id, "alpha");
        assert_eq!(report.flows[0].valid, 1);
        assert_eq!(report.flows[0].infra_failed, 1);
        assert_eq!(report.flows[0].invalid, 1);
        assert_eq!(
            report.flows[0].failures,
            FailureBuckets {
                infra: 1,
                oracle: 0,
                mission: 1
            }
        );
        assert_eq!(report.flows[1].skipped, 1);
        assert_eq!(report.flows[1].failures.oracle, 1);
        assert_eq!(
            report.failures,
            FailureBuckets {
                infra: 1,
                oracle: 1,
                mission: 1
            }
        );
        assert_eq!(report.gates_passed, 0);
        assert_eq!(report.gates_failed, 3);
    }

    #[test]
    fn infra_takes_precedence_over_oracle() {
        let attempt = attempt(
            0,
            AttemptOutcome::Invalid,
            &["ZCL_E_ORACLE_ASSERT", reason_codes::ATTEMPT_TIMEOUT],
        );
        assert_eq!(classify_failure(&attempt), FailureBucket::Infra);
    }

    #[test]
    fn summary_flags_claimed_but_unverified_missions() {
        let summary = build_summary(&sample_state());

        let mission0 = &summary.missions[0];
        assert!(mission0.claimed_ok);
        assert!(!mission0.verified_ok);
        assert!(mission0.mismatch);
        assert!(!summary.missions[1].mismatch);
        assert_eq!(summary.mismatches, 1);
    }

    #[test]
    fn demoted_duplicate_still_counts_as_claimed() {
        let mut state = sample_state();
        let mut duplicate = attempt(1, AttemptOutcome::Valid, &[]);
        crate::core::idempotency::mark_duplicate(&mut duplicate);
        state.flows = vec![FlowRun {
            flow_id: "alpha".to_string(),
            runner_type: "process".to_string(),
            suite_file: String::new(),
            ok: false,
            attempts: vec![duplicate],
        }];

        let summary = build_summary(&state);
        let mission1 = &summary.missions[1];
        assert!(mission1.claimed_ok);
        assert!(!mission1.verified_ok);
        assert!(mission1.mismatch);
    }

    #[test]
    fn failure_codes_rank_by_count_then_code() {
        let summary = build_summary(&sample_state());
        let ranked: Vec<(&str, usize)> = summary
            .top_failure_codes
            .iter()
            .map(|entry| (entry.code.as_str(), entry.count))
            .collect();
        assert_eq!(
            ranked,
            vec![
                (reason_codes::ATTEMPT_NOT_VALID, 2),
                ("ZCL_E_ORACLE_ASSERT", 2),
                ("ZCL_E_MISSION_EXIT_NONZERO", 1),
                (reason_codes::SPAWN_FAILED, 1),
            ]
        );
    }

    #[test]
    fn report_is_deterministic() {
        let state = sample_state();
        assert_eq!(build_summary(&state), build_summary(&state));
    }
}
