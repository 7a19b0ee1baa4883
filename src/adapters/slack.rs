//! Slack adapters: channel history source, approval-reaction gate and
//! incoming-webhook sink.
//!
//! Web API calls authenticate with a bot token (Bearer). The webhook sink
//! only needs the webhook URL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Sink, Source, Transform};
use crate::domain::{Content, Delivery, Item, ItemId, Outcome, SourceRef};

const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// `reactions.get` error for a message deleted since it was polled
const MESSAGE_NOT_FOUND: &str = "message_not_found";

/// Envelope shared by Slack Web API responses
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    message: Option<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    reactions: Vec<Reaction>,
}

#[derive(Debug, Deserialize)]
struct Reaction {
    name: String,
}

/// Minimal Slack Web API client
struct SlackApi {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl SlackApi {
    fn new(token: String) -> Self {
        Self {
            token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    /// Send a request and parse the envelope without checking `ok`
    async fn request(&self, method: &str, query: &[(&str, String)]) -> Result<SlackResponse> {
        let response = self
            .client
            .get(self.api_url(method))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to call Slack {}", method))?;

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))
    }

    async fn call(&self, method: &str, query: &[(&str, String)]) -> Result<SlackResponse> {
        let result = self.request(method, query).await?;
        if !result.ok {
            anyhow::bail!(
                "Slack API error from {}: {}",
                method,
                result.error.unwrap_or_default()
            );
        }

        Ok(result)
    }
}

/// Recent messages of a Slack channel, keyed by message timestamp
pub struct SlackHistorySource {
    api: SlackApi,
    limit: u32,
}

impl SlackHistorySource {
    pub fn new(token: String, limit: u32) -> Self {
        Self {
            api: SlackApi::new(token),
            limit,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api.api_base = base.into().trim_end_matches('/').to_string();
        self
    }
}

/// Slack returns newest first; flip to oldest first
fn history_items(messages: Vec<SlackMessage>, source: &SourceRef) -> Vec<Item> {
    let mut items: Vec<Item> = messages
        .into_iter()
        .filter_map(|msg| {
            let ts = msg.ts?;
            Some(Item {
                source: source.clone(),
                observed_at: ts_to_datetime(&ts),
                id: ItemId::Text(ts),
                payload: msg.text,
                attachment: None,
            })
        })
        .collect();
    items.reverse();
    items
}

fn ts_to_datetime(ts: &str) -> DateTime<Utc> {
    ts.split('.')
        .next()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl Source for SlackHistorySource {
    fn name(&self) -> &str {
        "slack_history"
    }

    async fn poll(&self, source: &SourceRef, _after: Option<&ItemId>) -> Result<Vec<Item>> {
        let response = self
            .api
            .call(
                "conversations.history",
                &[
                    ("channel", source.to_string()),
                    ("limit", self.limit.to_string()),
                ],
            )
            .await?;

        Ok(history_items(response.messages, source))
    }
}

/// Forwards a message only if it carries the approval reaction.
///
/// The reaction is checked once; a message without it is suppressed and
/// never looked at again. So is a message deleted before the check.
pub struct ReactionGate {
    api: SlackApi,
    reaction: String,
}

impl ReactionGate {
    pub fn new(token: String, reaction: impl Into<String>) -> Self {
        Self {
            api: SlackApi::new(token),
            reaction: reaction.into(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn decide(&self, item: &Item, response: SlackResponse) -> Outcome {
        if !response.ok {
            let error = response.error.unwrap_or_default();
            if error == MESSAGE_NOT_FOUND {
                debug!(source = %item.source, item_id = %item.id, "Message deleted, suppressing");
                return Outcome::Suppress;
            }
            return Outcome::Fail(format!("Slack API error from reactions.get: {}", error));
        }

        match response.message {
            Some(msg) if msg.reactions.iter().any(|r| r.name == self.reaction) => {
                Outcome::Deliver(Content::from_item(item, msg.text))
            }
            Some(_) => Outcome::Suppress,
            None => {
                debug!(source = %item.source, item_id = %item.id, "Message missing, suppressing");
                Outcome::Suppress
            }
        }
    }
}

#[async_trait]
impl Transform for ReactionGate {
    fn name(&self) -> &str {
        "reaction_gate"
    }

    async fn apply(&self, item: &Item) -> Outcome {
        let result = self
            .api
            .request(
                "reactions.get",
                &[
                    ("channel", item.source.to_string()),
                    ("timestamp", item.id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(response) => self.decide(item, response),
            Err(e) => Outcome::Fail(format!("{:#}", e)),
        }
    }
}

/// Payload for Slack incoming webhooks
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts content to a Slack incoming webhook.
///
/// Webhooks accept text only; attachments are not forwarded.
pub struct SlackWebhookSink {
    webhook_url: String,
    label_source: bool,
    client: reqwest::Client,
}

impl SlackWebhookSink {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            label_source: false,
            client: reqwest::Client::new(),
        }
    }

    /// Prefix messages with a banner naming the source channel
    pub fn label_source(mut self, enabled: bool) -> Self {
        self.label_source = enabled;
        self
    }

    fn format(&self, content: &Content) -> String {
        if self.label_source {
            format!(
                "*-----------   '{}'   -----------*\n\n{}",
                content.source, content.text
            )
        } else {
            content.text.clone()
        }
    }
}

#[async_trait]
impl Sink for SlackWebhookSink {
    fn name(&self) -> &str {
        "slack_webhook"
    }

    async fn deliver(&self, content: &Content) -> Delivery {
        if content.attachment.is_some() {
            debug!(source = %content.source, "Webhook sink drops attachment");
        }

        let text = self.format(content);
        let response = match self
            .client
            .post(&self.webhook_url)
            .json(&WebhookPayload { text: &text })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Delivery::Fail(format!("Webhook request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            Delivery::Ack
        } else {
            let body = response.text().await.unwrap_or_default();
            Delivery::Fail(format!("Webhook request failed: {}, {}", status, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_oldest_first() {
        let raw = r#"{"ok": true, "messages": [
            {"ts": "1712345678.000300", "text": "newest"},
            {"ts": "1712345678.000200", "text": "middle"},
            {"text": "no ts"},
            {"ts": "1712345678.000100", "text": "oldest"}
        ]}"#;
        let response: SlackResponse = serde_json::from_str(raw).unwrap();
        let items = history_items(response.messages, &SourceRef::from("C09"));

        let texts: Vec<&str> = items.iter().map(|i| i.payload.as_str()).collect();
        assert_eq!(texts, vec!["oldest", "middle", "newest"]);
        assert!(items[0].id < items[2].id);
    }

    #[test]
    fn test_reaction_gate_decisions() {
        let gate = ReactionGate::new("xoxb".to_string(), "white_check_mark");
        let item = Item::new(SourceRef::from("C09"), "1712345678.000100", "draft");

        let approved: SlackResponse = serde_json::from_str(
            r#"{"ok": true, "message": {"ts": "1712345678.000100", "text": "approved text",
                "reactions": [{"name": "eyes"}, {"name": "white_check_mark"}]}}"#,
        )
        .unwrap();
        match gate.decide(&item, approved) {
            Outcome::Deliver(content) => assert_eq!(content.text, "approved text"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let pending: SlackResponse = serde_json::from_str(
            r#"{"ok": true, "message": {"ts": "1712345678.000100", "text": "x"}}"#,
        )
        .unwrap();
        assert_eq!(gate.decide(&item, pending), Outcome::Suppress);

        let rate_limited: SlackResponse =
            serde_json::from_str(r#"{"ok": false, "error": "ratelimited"}"#).unwrap();
        assert!(matches!(gate.decide(&item, rate_limited), Outcome::Fail(_)));
    }

    #[test]
    fn test_reaction_gate_suppresses_deleted_message() {
        let gate = ReactionGate::new("xoxb".to_string(), "white_check_mark");
        let item = Item::new(SourceRef::from("C09"), "1712345678.000100", "draft");

        let deleted: SlackResponse =
            serde_json::from_str(r#"{"ok": false, "error": "message_not_found"}"#).unwrap();
        assert_eq!(gate.decide(&item, deleted), Outcome::Suppress);

        let empty: SlackResponse = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert_eq!(gate.decide(&item, empty), Outcome::Suppress);
    }

    #[test]
    fn test_webhook_banner() {
        let sink = SlackWebhookSink::new("https://hooks.example/x".to_string()).label_source(true);
        let content = Content::new(SourceRef::from("dmytrogorin"), "hello");
        assert_eq!(
            sink.format(&content),
            "*-----------   'dmytrogorin'   -----------*\n\nhello"
        );
    }
}
