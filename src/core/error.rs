//! Failure taxonomy for a monitor cycle.
//!
//! None of these end the loop; they are logged and collected into the
//! cycle report. Only an external shutdown stops a monitor.

use thiserror::Error;

use crate::domain::{ItemId, SourceRef};

use super::checkpoint::CheckpointError;
use super::retry::StepError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("poll of source '{source_ref}' failed: {reason}")]
    TransientSource { source_ref: SourceRef, reason: String },

    #[error("transform of {source_ref}/{item_id} failed: {reason}")]
    Transform {
        source_ref: SourceRef,
        item_id: ItemId,
        reason: String,
    },

    #[error("delivery of {source_ref}/{item_id} failed: {reason}")]
    TransientSink {
        source_ref: SourceRef,
        item_id: ItemId,
        reason: String,
    },

    #[error("checkpoint persistence failed: {0}")]
    Persistence(#[from] CheckpointError),

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl MonitorError {
    /// Map a poll step failure
    pub fn from_poll(source: &SourceRef, err: StepError) -> Self {
        if err.is_cancelled() {
            return Self::Cancelled;
        }
        Self::TransientSource {
            source_ref: source.clone(),
            reason: err.to_string(),
        }
    }

    /// Map a transform step failure
    pub fn from_transform(source: &SourceRef, item_id: &ItemId, err: StepError) -> Self {
        if err.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Transform {
            source_ref: source.clone(),
            item_id: item_id.clone(),
            reason: err.to_string(),
        }
    }

    /// Map a deliver step failure
    pub fn from_deliver(source: &SourceRef, item_id: &ItemId, err: StepError) -> Self {
        if err.is_cancelled() {
            return Self::Cancelled;
        }
        Self::TransientSink {
            source_ref: source.clone(),
            item_id: item_id.clone(),
            reason: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
