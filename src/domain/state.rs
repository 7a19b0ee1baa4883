//! Durable poll state and its reconstruction from checkpoint events.
//!
//! A `PollState` is owned by exactly one running monitor. It is rebuilt
//! at startup by replaying the monitor's checkpoint log: the latest
//! `epoch_started` snapshot, then every later event applied in order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{CheckpointEvent, CheckpointKind};
use super::item::{ItemId, SourceRef};
use super::tracker::IdentityTracker;

/// The unit of durable memory for one monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollState {
    /// Monitor this state belongs to
    pub monitor: String,

    /// Sources visited each cycle, in order
    pub sources: Vec<SourceRef>,

    /// What has already been handled
    pub tracker: IdentityTracker,

    /// Start of the current epoch
    pub epoch_start: DateTime<Utc>,

    /// Items that failed in earlier cycles and are still pending
    #[serde(default)]
    pub failures: FailureLedger,
}

impl PollState {
    /// Fresh state at first start
    pub fn new(
        monitor: impl Into<String>,
        sources: Vec<SourceRef>,
        tracker: IdentityTracker,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            monitor: monitor.into(),
            sources,
            tracker,
            epoch_start: now,
            failures: FailureLedger::default(),
        }
    }

    /// Has the current epoch lasted at least `epoch_length`?
    pub fn rotation_due(&self, now: DateTime<Utc>, epoch_length: Duration) -> bool {
        let age = now.signed_duration_since(self.epoch_start);
        match chrono::Duration::from_std(epoch_length) {
            Ok(length) => age >= length,
            // Longer than chrono can represent: never due
            Err(_) => false,
        }
    }

    /// New epoch carrying the current tracker and failures forward
    pub fn rotated(&self, now: DateTime<Utc>) -> Self {
        Self {
            epoch_start: now,
            ..self.clone()
        }
    }

    /// Reconstruct state from a checkpoint log.
    ///
    /// Returns `None` if the log holds no snapshot to start from.
    pub fn from_events(events: &[CheckpointEvent]) -> Option<Self> {
        let start = events
            .iter()
            .rposition(|e| matches!(e.event, CheckpointKind::EpochStarted { .. }))?;

        let mut state = match &events[start].event {
            CheckpointKind::EpochStarted { state } => state.clone(),
            _ => return None,
        };

        for event in &events[start + 1..] {
            state.apply_event(event);
        }

        Some(state)
    }

    /// Apply a single event to update state
    pub fn apply_event(&mut self, event: &CheckpointEvent) {
        match &event.event {
            CheckpointKind::EpochStarted { state } => {
                *self = state.clone();
            }
            CheckpointKind::ItemDone {
                source, item_id, ..
            } => {
                self.tracker.mark_done(source, item_id);
                self.failures.clear(source, item_id);
            }
            CheckpointKind::ItemFailed {
                source,
                item_id,
                error,
            } => {
                self.failures
                    .record(source, item_id, error, event.timestamp);
            }
        }
    }
}

/// Consecutive failure counts for items not yet handled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureLedger {
    entries: Vec<FailureRecord>,
}

/// Failure history of one pending item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub source: SourceRef,
    pub item_id: ItemId,
    /// Number of cycles in which the item failed
    pub count: u32,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
}

impl FailureLedger {
    /// Record one more failure and return the new count
    pub fn record(
        &mut self,
        source: &SourceRef,
        item_id: &ItemId,
        error: &str,
        at: DateTime<Utc>,
    ) -> u32 {
        if let Some(entry) = self.find_mut(source, item_id) {
            entry.count += 1;
            entry.last_error = error.to_string();
            return entry.count;
        }

        self.entries.push(FailureRecord {
            source: source.clone(),
            item_id: item_id.clone(),
            count: 1,
            last_error: error.to_string(),
            first_failed_at: at,
        });
        1
    }

    /// Forget an item's failures (it was handled)
    pub fn clear(&mut self, source: &SourceRef, item_id: &ItemId) {
        self.entries
            .retain(|e| !(e.source == *source && e.item_id == *item_id));
    }

    /// Drop entries of `source` whose id fails `keep`; returns how many went
    pub fn prune(&mut self, source: &SourceRef, keep: impl Fn(&ItemId) -> bool) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.source != *source || keep(&e.item_id));
        before - self.entries.len()
    }

    pub fn count(&self, source: &SourceRef, item_id: &ItemId) -> u32 {
        self.get(source, item_id).map(|e| e.count).unwrap_or(0)
    }

    pub fn get(&self, source: &SourceRef, item_id: &ItemId) -> Option<&FailureRecord> {
        self.entries
            .iter()
            .find(|e| e.source == *source && e.item_id == *item_id)
    }

    pub fn entries(&self) -> &[FailureRecord] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_mut(&mut self, source: &SourceRef, item_id: &ItemId) -> Option<&mut FailureRecord> {
        self.entries
            .iter_mut()
            .find(|e| e.source == *source && e.item_id == *item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Disposition;

    fn state_at(now: DateTime<Utc>) -> PollState {
        PollState::new(
            "tg",
            vec![SourceRef::from("chan")],
            IdentityTracker::cursor(),
            now,
        )
    }

    #[test]
    fn test_rotation_due_at_exact_length() {
        let t0 = Utc::now();
        let state = state_at(t0);
        let hour = Duration::from_secs(3600);

        assert!(!state.rotation_due(t0 + chrono::Duration::seconds(3599), hour));
        assert!(state.rotation_due(t0 + chrono::Duration::seconds(3600), hour));
    }

    #[test]
    fn test_from_events_starts_at_latest_snapshot() {
        let t0 = Utc::now();
        let source = SourceRef::from("chan");
        let mut first = state_at(t0);
        first.tracker.mark_done(&source, &ItemId::Num(5));

        let second = state_at(t0 + chrono::Duration::hours(1));

        let events = vec![
            CheckpointEvent::epoch_started(&first, t0),
            CheckpointEvent::item_done("tg", &source, &ItemId::Num(9), Disposition::Delivered, t0),
            CheckpointEvent::epoch_started(&second, second.epoch_start),
            CheckpointEvent::item_done("tg", &source, &ItemId::Num(3), Disposition::Suppressed, t0),
        ];

        let state = PollState::from_events(&events).unwrap();
        assert_eq!(state.epoch_start, second.epoch_start);
        assert_eq!(state.tracker.poll_hint(&source), Some(&ItemId::Num(3)));
    }

    #[test]
    fn test_from_events_without_snapshot() {
        let source = SourceRef::from("chan");
        let events = vec![CheckpointEvent::item_done(
            "tg",
            &source,
            &ItemId::Num(1),
            Disposition::Delivered,
            Utc::now(),
        )];
        assert!(PollState::from_events(&events).is_none());
    }

    #[test]
    fn test_failure_ledger_counts_and_clears() {
        let mut ledger = FailureLedger::default();
        let source = SourceRef::from("chan");
        let id = ItemId::Num(55);

        assert_eq!(ledger.record(&source, &id, "timeout", Utc::now()), 1);
        assert_eq!(ledger.record(&source, &id, "500", Utc::now()), 2);
        assert_eq!(ledger.get(&source, &id).unwrap().last_error, "500");

        ledger.clear(&source, &id);
        assert_eq!(ledger.count(&source, &id), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_failure_ledger_prune_is_per_source() {
        let mut ledger = FailureLedger::default();
        let chan = SourceRef::from("chan");
        let other = SourceRef::from("other");
        ledger.record(&chan, &ItemId::Num(1), "timeout", Utc::now());
        ledger.record(&chan, &ItemId::Num(2), "timeout", Utc::now());
        ledger.record(&other, &ItemId::Num(1), "timeout", Utc::now());

        assert_eq!(ledger.prune(&chan, |id| *id == ItemId::Num(2)), 1);
        assert_eq!(ledger.count(&chan, &ItemId::Num(1)), 0);
        assert_eq!(ledger.count(&chan, &ItemId::Num(2)), 1);
        assert_eq!(ledger.count(&other, &ItemId::Num(1)), 1);
    }
}
