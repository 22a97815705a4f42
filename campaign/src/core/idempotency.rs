//! Idempotency keys and the replay-derived ledger index.
//!
//! The progress ledger is the source of truth; [`LedgerIndex`] is the
//! in-memory index rebuilt from it on every start.

use std::collections::BTreeSet;

use crate::core::reason_codes;
use crate::core::types::{AttemptOutcome, AttemptStatus, ProgressEvent};

/// Key identifying one flow's attempt at one mission: `campaignId:flowId:missionIndex`.
pub fn attempt_key(campaign_id: &str, flow_id: &str, mission_index: u32) -> String {
    format!("{campaign_id}:{flow_id}:{mission_index}")
}

/// Key identifying one mission's gate: `campaignId:gate:missionIndex`.
pub fn gate_key(campaign_id: &str, mission_index: u32) -> String {
    format!("{campaign_id}:gate:{mission_index}")
}

/// Completed missions and seen idempotency keys, derived from ledger events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerIndex {
    completed: BTreeSet<u32>,
    seen_keys: BTreeSet<String>,
}

impl LedgerIndex {
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a ProgressEvent>,
    {
        let mut index = Self::default();
        for event in events {
            index.observe(event);
        }
        index
    }

    /// Fold one event into the index.
    pub fn observe(&mut self, event: &ProgressEvent) {
        if event.status.is_terminal_gate() {
            self.completed.insert(event.mission_index);
        }
        if let Some(key) = event.idempotency_key.as_deref()
            && !key.is_empty()
        {
            self.seen_keys.insert(key.to_string());
        }
    }

    pub fn is_completed(&self, mission_index: u32) -> bool {
        self.completed.contains(&mission_index)
    }

    pub fn completed(&self) -> &BTreeSet<u32> {
        &self.completed
    }

    pub fn has_seen(&self, key: &str) -> bool {
        self.seen_keys.contains(key)
    }

    pub fn seen_key_count(&self) -> usize {
        self.seen_keys.len()
    }
}

/// Mark an attempt as a replay of an already-recorded key.
///
/// A `valid` attempt is demoted to `invalid`; the duplicate reason is added once.
pub fn mark_duplicate(attempt: &mut AttemptStatus) {
    attempt.record_claim();
    if attempt.status == AttemptOutcome::Valid {
        attempt.status = AttemptOutcome::Invalid;
    }
    attempt
        .errors
        .push(reason_codes::DUPLICATE_ATTEMPT.to_string());
    reason_codes::normalize(&mut attempt.errors);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProgressStatus;
    use chrono::{TimeZone, Utc};

    fn event(index: u32, status: ProgressStatus, key: Option<&str>) -> ProgressEvent {
        ProgressEvent {
            run_id: "run".to_string(),
            mission_index: index,
            mission_id: format!("m{index}"),
            flow_id: None,
            attempt_id: None,
            attempt_dir: None,
            status,
            reason_codes: Vec::new(),
            idempotency_key: key.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn keys_have_stable_shape() {
        assert_eq!(attempt_key("camp", "flow-a", 3), "camp:flow-a:3");
        assert_eq!(gate_key("camp", 3), "camp:gate:3");
    }

    #[test]
    fn only_gate_events_complete_missions() {
        let events = vec![
            event(0, ProgressStatus::Valid, Some("camp:a:0")),
            event(0, ProgressStatus::GatePass, Some("camp:gate:0")),
            event(1, ProgressStatus::Valid, Some("camp:a:1")),
            event(2, ProgressStatus::GateFail, Some("camp:gate:2")),
            event(3, ProgressStatus::WatchdogHeartbeat, None),
        ];
        let index = LedgerIndex::from_events(&events);

        assert!(index.is_completed(0));
        assert!(!index.is_completed(1));
        assert!(index.is_completed(2));
        assert!(!index.is_completed(3));
        assert!(index.has_seen("camp:a:1"));
        assert_eq!(index.seen_key_count(), 4);
    }

    #[test]
    fn empty_keys_are_not_recorded() {
        let index = LedgerIndex::from_events(&[event(0, ProgressStatus::Valid, Some(""))]);
        assert_eq!(index.seen_key_count(), 0);
    }

    #[test]
    fn mark_duplicate_demotes_valid_attempts() {
        let mut attempt = AttemptStatus {
            mission_index: 0,
            mission_id: "m0".to_string(),
            attempt_id: "a".to_string(),
            attempt_dir: String::new(),
            status: AttemptOutcome::Valid,
            errors: Vec::new(),
            claimed_status: None,
        };
        mark_duplicate(&mut attempt);
        mark_duplicate(&mut attempt);
        assert_eq!(attempt.status, AttemptOutcome::Invalid);
        assert_eq!(attempt.claimed(), AttemptOutcome::Valid);
        assert_eq!(attempt.errors, vec![reason_codes::DUPLICATE_ATTEMPT]);
    }

    #[test]
    fn mark_duplicate_keeps_infra_failures() {
        let mut attempt = AttemptStatus {
            mission_index: 0,
            mission_id: "m0".to_string(),
            attempt_id: "a".to_string(),
            attempt_dir: String::new(),
            status: AttemptOutcome::InfraFailed,
            errors: vec![reason_codes::SPAWN_FAILED.to_string()],
            claimed_status: None,
        };
        mark_duplicate(&mut attempt);
        assert_eq!(attempt.status, AttemptOutcome::InfraFailed);
        assert_eq!(attempt.errors.len(), 2);
    }
}
