//! Translation transform backed by the Anthropic Messages API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Transform;
use crate::domain::{Content, Item, Outcome};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub const DEFAULT_INSTRUCTIONS: &str = "Translate the following message to English. \
Do not change the links. If message is already in English, just return it as is.";

/// Translates item text to English
pub struct TranslateTransform {
    api_key: String,
    model: String,
    max_tokens: u32,
    instructions: String,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl TranslateTransform {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            api_key,
            model,
            max_tokens,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn prompt(&self, text: &str) -> String {
        format!("{}\n\n{}", self.instructions, text)
    }

    async fn translate(&self, text: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![RequestMessage {
                role: "user",
                content: self.prompt(text),
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .context("Failed to call Anthropic Messages API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            anyhow::bail!("Anthropic API error ({}): {}", status, message);
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        first_text(parsed).context("Anthropic response contained no text")
    }
}

fn first_text(response: MessagesResponse) -> Option<String> {
    response
        .content
        .into_iter()
        .find(|block| block.kind == "text")
        .and_then(|block| block.text)
        .filter(|text| !text.trim().is_empty())
}

#[async_trait]
impl Transform for TranslateTransform {
    fn name(&self) -> &str {
        "translate"
    }

    async fn apply(&self, item: &Item) -> Outcome {
        if item.payload.trim().is_empty() {
            return Outcome::Suppress;
        }

        match self.translate(&item.payload).await {
            Ok(translated) => Outcome::Deliver(Content::from_item(item, translated)),
            Err(e) => Outcome::Fail(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceRef;

    fn transform() -> TranslateTransform {
        TranslateTransform::new("key".to_string(), "model".to_string(), 1000)
    }

    #[test]
    fn test_prompt_prefixes_instructions() {
        let prompt = transform().prompt("Привіт https://t.me/x");
        assert!(prompt.starts_with("Translate the following message to English."));
        assert!(prompt.ends_with("\n\nПривіт https://t.me/x"));
    }

    #[test]
    fn test_first_text_block() {
        let raw = r#"{"content": [{"type": "thinking"}, {"type": "text", "text": "Hello"}]}"#;
        let response: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(first_text(response), Some("Hello".to_string()));
    }

    #[tokio::test]
    async fn test_empty_payload_is_suppressed() {
        let item = Item::new(SourceRef::from("chan"), 7, "");
        assert_eq!(transform().apply(&item).await, Outcome::Suppress);
    }
}
