//! Identity tracking: which items have already been handled.
//!
//! Two strategies share one contract:
//! - Cursor: highest handled id per source; anything above it is new.
//! - Set: bounded, ordered list of handled ids per source, compacted
//!   down to the most recent entries once it overflows.
//!
//! Neither strategy ever lowers a cursor or forgets an id except through
//! the set's eviction rule.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::domain::{ItemId, SourceRef};

/// Which dedup strategy a monitor uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    Cursor,
    Set,
}

/// Size limits for the set strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBounds {
    /// Largest allowed length of a source's handled list
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Length kept (newest entries) after an overflow
    #[serde(default = "default_retain")]
    pub retain: usize,
}

fn default_max_len() -> usize {
    50
}
fn default_retain() -> usize {
    20
}

impl Default for SetBounds {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            retain: default_retain(),
        }
    }
}

/// Per-source record of handled items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityTracker {
    Cursor {
        #[serde(default)]
        last_ids: BTreeMap<SourceRef, ItemId>,
    },
    Set {
        #[serde(default)]
        handled: BTreeMap<SourceRef, VecDeque<ItemId>>,
        #[serde(default)]
        bounds: SetBounds,
    },
}

impl IdentityTracker {
    /// Empty cursor tracker
    pub fn cursor() -> Self {
        Self::Cursor {
            last_ids: BTreeMap::new(),
        }
    }

    /// Empty set tracker
    pub fn set(bounds: SetBounds) -> Self {
        Self::Set {
            handled: BTreeMap::new(),
            bounds,
        }
    }

    /// Empty tracker for a mode
    pub fn for_mode(mode: TrackingMode, bounds: SetBounds) -> Self {
        match mode {
            TrackingMode::Cursor => Self::cursor(),
            TrackingMode::Set => Self::set(bounds),
        }
    }

    pub fn mode(&self) -> TrackingMode {
        match self {
            Self::Cursor { .. } => TrackingMode::Cursor,
            Self::Set { .. } => TrackingMode::Set,
        }
    }

    /// Has this item not been handled yet?
    pub fn is_new(&self, source: &SourceRef, id: &ItemId) -> bool {
        match self {
            Self::Cursor { last_ids } => id > last_ids.get(source).unwrap_or(&ItemId::ZERO),
            Self::Set { handled, .. } => handled
                .get(source)
                .map(|ids| !ids.contains(id))
                .unwrap_or(true),
        }
    }

    /// Record an item as handled
    pub fn mark_done(&mut self, source: &SourceRef, id: &ItemId) {
        match self {
            Self::Cursor { last_ids } => {
                let entry = last_ids.entry(source.clone()).or_insert(ItemId::ZERO);
                if *id > *entry {
                    *entry = id.clone();
                }
            }
            Self::Set { handled, bounds } => {
                let ids = handled.entry(source.clone()).or_default();
                if ids.contains(id) {
                    return;
                }
                ids.push_back(id.clone());
                if ids.len() > bounds.max_len {
                    let evict = ids.len() - bounds.retain.min(ids.len());
                    ids.drain(..evict);
                }
            }
        }
    }

    /// Lower bound a source may use to narrow its query (cursor only)
    pub fn poll_hint(&self, source: &SourceRef) -> Option<&ItemId> {
        match self {
            Self::Cursor { last_ids } => last_ids.get(source),
            Self::Set { .. } => None,
        }
    }

    /// Handled ids for a source, oldest first (set only)
    pub fn handled(&self, source: &SourceRef) -> Option<&VecDeque<ItemId>> {
        match self {
            Self::Cursor { .. } => None,
            Self::Set { handled, .. } => handled.get(source),
        }
    }

    /// Number of sources with tracking state
    pub fn source_count(&self) -> usize {
        match self {
            Self::Cursor { last_ids } => last_ids.len(),
            Self::Set { handled, .. } => handled.len(),
        }
    }

    /// One-line human summary per source
    pub fn describe(&self) -> Vec<(SourceRef, String)> {
        match self {
            Self::Cursor { last_ids } => last_ids
                .iter()
                .map(|(s, id)| (s.clone(), format!("cursor {}", id)))
                .collect(),
            Self::Set { handled, bounds } => handled
                .iter()
                .map(|(s, ids)| {
                    let newest = ids.back().map(|id| id.to_string()).unwrap_or_default();
                    (
                        s.clone(),
                        format!("{}/{} handled, newest {}", ids.len(), bounds.max_len, newest),
                    )
                })
                .collect(),
        }
    }
}
