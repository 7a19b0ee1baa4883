//! Adapter interfaces for external systems.
//!
//! A monitor is wired from three capabilities:
//! - `Source`: fetch items from a channel, oldest first
//! - `Transform`: rewrite or filter one item
//! - `Sink`: deliver finished content
//!
//! Adapters report failures as values (`Outcome::Fail`, `Delivery::Fail`
//! or an `Err` from `poll`); retries are the orchestrator's job.

pub mod anthropic;
pub mod slack;
pub mod telegram;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{MonitorConfig, SinkConfig, SourceConfig, TransformConfig};
use crate::domain::{Content, Delivery, Item, ItemId, Outcome, SourceRef};

pub use anthropic::TranslateTransform;
pub use slack::{ReactionGate, SlackHistorySource, SlackWebhookSink};
pub use telegram::TelegramSource;

/// Fetches new items from a monitored source
#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Items on `source`, oldest first.
    ///
    /// `after` is the source's cursor when the monitor tracks one; adapters
    /// may use it to narrow the query but the orchestrator filters anyway.
    async fn poll(&self, source: &SourceRef, after: Option<&ItemId>) -> Result<Vec<Item>>;
}

/// Turns an item into deliverable content, or drops it
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    /// Must be safe to call again for the same item
    async fn apply(&self, item: &Item) -> Outcome;
}

/// Delivers content to its destination
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, content: &Content) -> Delivery;
}

/// The capabilities one monitor runs with
#[derive(Clone)]
pub struct Adapters {
    pub source: Arc<dyn Source>,
    pub transform: Arc<dyn Transform>,
    pub sink: Arc<dyn Sink>,
}

impl Adapters {
    pub fn new(
        source: Arc<dyn Source>,
        transform: Arc<dyn Transform>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            source,
            transform,
            sink,
        }
    }

    /// Build the adapters a monitor's config asks for
    pub fn from_config(monitor: &MonitorConfig) -> Result<Self> {
        let source: Arc<dyn Source> = match &monitor.source {
            SourceConfig::Telegram {
                token_env,
                api_base,
            } => {
                let mut source = TelegramSource::new(require_env(token_env)?);
                if let Some(base) = api_base {
                    source = source.with_api_base(base);
                }
                Arc::new(source)
            }
            SourceConfig::SlackHistory {
                token_env, api_base, ..
            } => {
                let limit = monitor.history_limit().unwrap_or(monitor.set_bounds.retain as u32);
                let mut source = SlackHistorySource::new(require_env(token_env)?, limit);
                if let Some(base) = api_base {
                    source = source.with_api_base(base);
                }
                Arc::new(source)
            }
        };

        let transform: Arc<dyn Transform> = match &monitor.transform {
            TransformConfig::Translate {
                api_key_env,
                model,
                instructions,
                max_tokens,
                api_base,
            } => {
                let mut transform =
                    TranslateTransform::new(require_env(api_key_env)?, model.clone(), *max_tokens);
                if let Some(text) = instructions {
                    transform = transform.with_instructions(text);
                }
                if let Some(base) = api_base {
                    transform = transform.with_api_base(base);
                }
                Arc::new(transform)
            }
            TransformConfig::ReactionGate {
                token_env,
                reaction,
                api_base,
            } => {
                let mut gate = ReactionGate::new(require_env(token_env)?, reaction.clone());
                if let Some(base) = api_base {
                    gate = gate.with_api_base(base);
                }
                Arc::new(gate)
            }
            TransformConfig::Passthrough => Arc::new(Passthrough),
        };

        let sink: Arc<dyn Sink> = match &monitor.sink {
            SinkConfig::SlackWebhook {
                webhook_env,
                label_source,
            } => Arc::new(SlackWebhookSink::new(require_env(webhook_env)?).label_source(*label_source)),
        };

        Ok(Self::new(source, transform, sink))
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} environment variable required", name))
}

/// Forwards the item text unchanged; empty items are suppressed
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl Transform for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn apply(&self, item: &Item) -> Outcome {
        if item.payload.trim().is_empty() && item.attachment.is_none() {
            return Outcome::Suppress;
        }
        Outcome::Deliver(Content::from_item(item, item.payload.clone()))
    }
}
