//! Core monitor machinery.
//!
//! This module contains:
//! - Checkpoint: append-only JSONL log with epoch rotation
//! - Retry: per-step timeout and backoff
//! - Shutdown: cooperative cancellation
//! - Orchestrator: the poll, dedupe, deliver loop

pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod shutdown;

// Re-export commonly used types
pub use checkpoint::{CheckpointError, CheckpointStore, JsonlCheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::MonitorError;
pub use orchestrator::{CycleReport, MonitorSettings, Orchestrator};
pub use retry::{run_with_retry, RetryPolicy, StepError, StepKind, StepPolicies};
pub use shutdown::{channel as shutdown_channel, Shutdown, ShutdownTrigger};
