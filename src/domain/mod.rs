//! Domain types for the channel monitor.
//!
//! This module contains the core data structures:
//! - Items: what sources produce and what transforms/sinks consume
//! - Tracker: which items were already handled
//! - State: the durable per-monitor poll state
//! - Events: immutable checkpoint records

pub mod events;
pub mod item;
pub mod state;
pub mod tracker;

// Re-export commonly used types
pub use events::{CheckpointEvent, CheckpointKind, DeadLetter};
pub use item::{Content, Delivery, Disposition, Item, ItemId, Outcome, SourceRef};
pub use state::{FailureLedger, FailureRecord, PollState};
pub use tracker::{IdentityTracker, SetBounds, TrackingMode};
