//! Pending-mission selection over a persisted plan.

use std::collections::BTreeSet;

use crate::core::types::PlanMission;

/// Optional shard window over plan positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissionWindow {
    /// Number of plan entries to skip.
    pub offset: u32,
    /// Maximum number of plan entries to consider after `offset`.
    pub limit: Option<u32>,
}

/// Missions still to run, in plan order.
///
/// The window is applied to plan positions first so shard boundaries do not move
/// as missions complete; completed missions are then removed.
pub fn pending_missions(
    plan: &[PlanMission],
    completed: &BTreeSet<u32>,
    window: MissionWindow,
) -> Vec<PlanMission> {
    let limit = window.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    plan.iter()
        .skip(window.offset as usize)
        .take(limit)
        .filter(|mission| !completed.contains(&mission.mission_index))
        .cloned()
        .collect()
}
