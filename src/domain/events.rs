//! Checkpoint events for a monitor's append-only log.
//!
//! Every state change a monitor makes is recorded as an event. Replaying
//! the events since the latest `EpochStarted` snapshot rebuilds the
//! monitor's `PollState` after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::{Disposition, Item, ItemId, SourceRef};
use super::state::PollState;

/// A single event in a monitor's checkpoint log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Monitor this event belongs to
    pub monitor: String,

    /// What happened
    pub event: CheckpointKind,
}

/// Kinds of checkpoint events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Full snapshot opening a new epoch
    EpochStarted { state: PollState },

    /// An item was handled and must never be processed again
    ItemDone {
        source: SourceRef,
        item_id: ItemId,
        disposition: Disposition,
    },

    /// An item failed in this cycle and stays pending
    ItemFailed {
        source: SourceRef,
        item_id: ItemId,
        error: String,
    },
}

impl CheckpointEvent {
    fn new(monitor: impl Into<String>, event: CheckpointKind, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: at,
            monitor: monitor.into(),
            event,
        }
    }

    /// Snapshot event for a rotation or first start
    pub fn epoch_started(state: &PollState, at: DateTime<Utc>) -> Self {
        Self::new(
            state.monitor.clone(),
            CheckpointKind::EpochStarted {
                state: state.clone(),
            },
            at,
        )
    }

    pub fn item_done(
        monitor: impl Into<String>,
        source: &SourceRef,
        item_id: &ItemId,
        disposition: Disposition,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            monitor,
            CheckpointKind::ItemDone {
                source: source.clone(),
                item_id: item_id.clone(),
                disposition,
            },
            at,
        )
    }

    pub fn item_failed(
        monitor: impl Into<String>,
        source: &SourceRef,
        item_id: &ItemId,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            monitor,
            CheckpointKind::ItemFailed {
                source: source.clone(),
                item_id: item_id.clone(),
                error: error.into(),
            },
            at,
        )
    }

    /// Short label used in logs
    pub fn kind_name(&self) -> &'static str {
        match self.event {
            CheckpointKind::EpochStarted { .. } => "epoch_started",
            CheckpointKind::ItemDone { .. } => "item_done",
            CheckpointKind::ItemFailed { .. } => "item_failed",
        }
    }
}

/// An item dropped after exhausting its failure budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub timestamp: DateTime<Utc>,
    pub monitor: String,
    pub source: SourceRef,
    pub item_id: ItemId,
    /// Failing cycles before the item was dropped
    pub failures: u32,
    pub last_error: String,
    /// Original message text, kept for manual replay
    pub payload: String,
}

impl DeadLetter {
    pub fn new(
        monitor: impl Into<String>,
        item: &Item,
        failures: u32,
        last_error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: at,
            monitor: monitor.into(),
            source: item.source.clone(),
            item_id: item.id.clone(),
            failures,
            last_error: last_error.into(),
            payload: item.payload.clone(),
        }
    }
}
