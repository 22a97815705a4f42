//! Persisted mission ordering (`campaign.plan.json`).
//!
//! A plan is built once per spec path and reused verbatim afterwards, so a
//! resumed run walks missions in exactly the order the first run chose.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::invariants::validate_plan;
use crate::core::types::{Plan, PlanMission, SCHEMA_VERSION};
use crate::io::atomic::write_json_atomic;
use crate::io::clock::Clock;

/// Return the plan for `spec_path`, building and persisting it on first use.
///
/// An existing plan for a different spec path is replaced.
#[instrument(skip_all, fields(plan = %path.display(), spec_path = %spec_path))]
pub fn ensure_plan<C: Clock + ?Sized>(
    path: &Path,
    campaign_id: &str,
    spec_path: &str,
    selected: &[PlanMission],
    clock: &C,
) -> Result<Plan> {
    if path.exists() {
        let existing = load_plan(path)?;
        if existing.spec_path == spec_path {
            debug!(missions = existing.missions.len(), "reusing persisted plan");
            return Ok(existing);
        }
        info!(
            previous = %existing.spec_path,
            "spec path changed; rebuilding plan"
        );
    }

    let plan = Plan {
        schema_version: SCHEMA_VERSION,
        campaign_id: campaign_id.to_string(),
        spec_path: spec_path.to_string(),
        created_at: clock.now(),
        missions: selected.to_vec(),
    };
    check_plan(&plan).with_context(|| format!("build plan {}", path.display()))?;
    write_json_atomic(path, &plan)?;
    info!(missions = plan.missions.len(), "plan created");
    Ok(plan)
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan: Plan = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    check_plan(&plan).with_context(|| format!("validate plan {}", path.display()))?;
    Ok(plan)
}

fn check_plan(plan: &Plan) -> Result<()> {
    let errors = validate_plan(plan);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::clock::SystemClock;

    fn missions(indexes: &[u32]) -> Vec<PlanMission> {
        indexes
            .iter()
            .map(|index| PlanMission::new(*index, format!("m{index}")))
            .collect()
    }

    #[test]
    fn plan_is_reused_for_same_spec_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.plan.json");

        let first =
            ensure_plan(&path, "camp", "spec.toml", &missions(&[2, 0, 1]), &SystemClock)
                .expect("first plan");
        let second = ensure_plan(&path, "camp", "spec.toml", &missions(&[0, 1]), &SystemClock)
            .expect("second plan");

        assert_eq!(second, first);
        let order: Vec<u32> = second.missions.iter().map(|m| m.mission_index).collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn plan_is_rebuilt_for_new_spec_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.plan.json");

        ensure_plan(&path, "camp", "a.toml", &missions(&[0, 1]), &SystemClock).expect("a");
        let plan =
            ensure_plan(&path, "camp", "b.toml", &missions(&[5]), &SystemClock).expect("b");

        assert_eq!(plan.spec_path, "b.toml");
        assert_eq!(load_plan(&path).expect("reload"), plan);
    }

    #[test]
    fn duplicate_mission_indexes_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.plan.json");

        let err = ensure_plan(&path, "camp", "spec.toml", &missions(&[1, 1]), &SystemClock)
            .unwrap_err();
        assert!(format!("{err:#}").contains("more than once"));
        assert!(!path.exists());
    }
}
