//! chanwatch - resumable poll, dedupe and deliver monitor
//!
//! Watches channels on a source service, runs each new message through
//! a transform and forwards the result to a sink.
//!
//! # Architecture
//!
//! Progress is checkpointed as an append-only event log:
//! - Every handled item is recorded as soon as it is handled
//! - State is rebuilt by replaying from the latest epoch snapshot
//! - The log is rotated into a fresh snapshot once an epoch ages out
//!
//! # Modules
//!
//! - `adapters`: Sources, transforms and sinks (Telegram, Slack, Anthropic)
//! - `core`: Orchestrator, checkpoint store, retry and shutdown
//! - `domain`: Data structures (Item, IdentityTracker, PollState, events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run every configured monitor
//! chanwatch run
//!
//! # One cycle of a single monitor
//! chanwatch run --monitor news --once
//!
//! # Inspect checkpoints
//! chanwatch status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{CycleReport, MonitorSettings, Orchestrator};
pub use domain::{IdentityTracker, Item, ItemId, PollState, SourceRef, TrackingMode};
