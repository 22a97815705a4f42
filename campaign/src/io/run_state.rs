//! Run-state snapshot storage (`campaign.run.state.json`).
//!
//! Loading validates against the embedded JSON Schema, then against the
//! semantic invariants. Writing canonicalizes, validates, and replaces the file
//! atomically.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::debug;

use crate::core::canonical::canonicalize_run_state;
use crate::core::invariants::validate_run_state;
use crate::core::types::RunState;
use crate::io::atomic::write_json_atomic;

const RUN_STATE_SCHEMA: &str = include_str!("../../schemas/run_state.v1.schema.json");

/// Load and validate a run-state snapshot (schema + invariants).
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate run state {}", path.display()))?;
    let state: RunState = serde_json::from_value(value)
        .with_context(|| format!("deserialize run state {}", path.display()))?;
    check_invariants(&state).with_context(|| format!("validate run state {}", path.display()))?;
    debug!(run_id = %state.run_id, status = state.status.as_str(), "run state loaded");
    Ok(state)
}

/// Load the snapshot if the file exists.
pub fn load_run_state_if_present(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    load_run_state(path).map(Some)
}

/// Canonicalize, validate, and atomically persist a snapshot.
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    let mut canonical = state.clone();
    canonicalize_run_state(&mut canonical);
    check_invariants(&canonical)
        .with_context(|| format!("refuse to write run state {}", path.display()))?;
    debug!(
        path = %path.display(),
        run_id = %canonical.run_id,
        status = canonical.status.as_str(),
        missions_completed = canonical.missions_completed,
        "writing run state"
    );
    write_json_atomic(path, &canonical)
}

fn schema() -> Result<&'static Validator> {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    if let Some(validator) = VALIDATOR.get() {
        return Ok(validator);
    }
    let schema_value: Value =
        serde_json::from_str(RUN_STATE_SCHEMA).context("parse run state schema")?;
    let compiled = validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {err}"))?;
    Ok(VALIDATOR.get_or_init(|| compiled))
}

fn validate_schema(value: &Value) -> Result<()> {
    let compiled = schema()?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "run state schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn check_invariants(state: &RunState) -> Result<()> {
    let errors = validate_run_state(state);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("run state invariants failed: {}", errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttemptOutcome, AttemptStatus, FlowRun, MissionGate, RunStatus};
    use chrono::{TimeZone, Utc};

    fn attempt(index: u32, errors: &[&str]) -> AttemptStatus {
        AttemptStatus {
            mission_index: index,
            mission_id: format!("m{index}"),
            attempt_id: format!("att-{index}"),
            attempt_dir: format!("attempts/{index}"),
            status: AttemptOutcome::Invalid,
            errors: errors.iter().map(|code| code.to_string()).collect(),
            claimed_status: None,
        }
    }

    fn unsorted_state() -> RunState {
        let mut state = RunState::new(
            "camp",
            "run-1",
            "spec.toml",
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        );
        state.total_missions = 2;
        state.missions_completed = 2;
        state.reason_codes = vec!["B".to_string(), "A".to_string(), "B".to_string()];
        state.flows = vec![
            FlowRun {
                flow_id: "zeta".to_string(),
                runner_type: "process".to_string(),
                suite_file: "suite.toml".to_string(),
                ok: false,
                attempts: vec![attempt(1, &["Y", "X"]), attempt(0, &[])],
            },
            FlowRun {
                flow_id: "alpha".to_string(),
                runner_type: "process".to_string(),
                suite_file: "suite.toml".to_string(),
                ok: false,
                attempts: vec![attempt(0, &[])],
            },
        ];
        state.mission_gates = vec![
            MissionGate {
                mission_index: 1,
                mission_id: "m1".to_string(),
                ok: false,
                reasons: vec!["R2".to_string(), "R1".to_string()],
                attempts: Vec::new(),
            },
            MissionGate {
                mission_index: 0,
                mission_id: "m0".to_string(),
                ok: true,
                reasons: Vec::new(),
                attempts: Vec::new(),
            },
        ];
        state
    }

    #[test]
    fn write_sorts_and_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.run.state.json");

        write_run_state(&path, &unsorted_state()).expect("write");
        let loaded = load_run_state(&path).expect("load");

        assert_eq!(loaded.flows[0].flow_id, "alpha");
        assert_eq!(loaded.flows[1].attempts[0].mission_index, 0);
        assert_eq!(loaded.flows[1].attempts[1].errors, vec!["X", "Y"]);
        assert_eq!(loaded.mission_gates[0].mission_index, 0);
        assert_eq!(loaded.mission_gates[1].reasons, vec!["R1", "R2"]);
        assert_eq!(loaded.reason_codes, vec!["A", "B"]);
    }

    #[test]
    fn rewriting_loaded_state_is_byte_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.run.state.json");

        write_run_state(&path, &unsorted_state()).expect("first write");
        let first = fs::read(&path).expect("read first");
        let loaded = load_run_state(&path).expect("load");
        write_run_state(&path, &loaded).expect("second write");
        let second = fs::read(&path).expect("read second");

        assert_eq!(first, second);
    }

    #[test]
    fn schema_rejects_unknown_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.run.state.json");
        write_run_state(&path, &unsorted_state()).expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        let tampered = contents.replace("\"status\": \"running\"", "\"status\": \"paused\"");
        fs::write(&path, tampered).expect("tamper");

        let err = load_run_state(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn schema_rejects_negative_counters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.run.state.json");
        write_run_state(&path, &unsorted_state()).expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        let tampered = contents.replace("\"missionOffset\": 0", "\"missionOffset\": -1");
        fs::write(&path, tampered).expect("tamper");

        assert!(load_run_state(&path).is_err());
    }

    #[test]
    fn write_refuses_inconsistent_counters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.run.state.json");
        let mut state = unsorted_state();
        state.missions_completed = 5;
        state.status = RunStatus::Invalid;

        let err = write_run_state(&path, &state).unwrap_err();
        assert!(format!("{err:#}").contains("missionsCompleted"));
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_loads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = load_run_state_if_present(&temp.path().join("absent.json")).expect("load");
        assert!(loaded.is_none());
    }
}
