//! Telegram Bot API source for channel posts.
//!
//! The bot must be a member of each monitored channel. One bot serves
//! every source of a monitor, so channel posts are kept in a shared
//! buffer and each poll picks out the posts of one chat.
//!
//! `getUpdates` returns at most 100 updates. A full page is followed by a
//! request with `offset` past its last update, which confirms that page
//! to Telegram; a partial page is never confirmed, so after a restart it
//! is fetched again. Buffered posts are dropped once the source's cursor
//! has passed them or they are older than Telegram keeps updates.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::Source;
use crate::domain::{Item, ItemId, SourceRef};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Largest page `getUpdates` returns
const PAGE_SIZE: usize = 100;

/// Upper bound on requests per poll
const MAX_PAGES_PER_POLL: usize = 20;

/// How long Telegram keeps unconfirmed updates
const RETENTION_HOURS: i64 = 24;

/// Telegram Bot API source
pub struct TelegramSource {
    /// Bot token
    bot_token: String,
    /// API base URL
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
    /// Channel posts fetched but not yet passed by their source's cursor
    buffer: Mutex<PostBuffer>,
}

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    channel_post: Option<ChannelPost>,
}

#[derive(Debug, Deserialize)]
struct ChannelPost {
    message_id: i64,
    date: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

impl Chat {
    /// Does this chat match a configured source (`@name`, `name` or numeric id)?
    fn matches(&self, source: &SourceRef) -> bool {
        let wanted = source.as_str().trim_start_matches('@');
        if wanted == self.id.to_string() {
            return true;
        }
        self.username
            .as_deref()
            .map(|u| u.eq_ignore_ascii_case(wanted))
            .unwrap_or(false)
    }
}

/// Channel posts collected across `getUpdates` pages
#[derive(Debug, Default)]
struct PostBuffer {
    /// Offset for the next request; updates below it are confirmed
    offset: Option<i64>,
    /// Posts keyed by update id
    posts: BTreeMap<i64, ChannelPost>,
}

impl PostBuffer {
    /// Store one page. Returns true when the page was full, in which case
    /// the offset moves past it and another page should be requested.
    fn absorb(&mut self, page: Vec<Update>) -> bool {
        let full = page.len() >= PAGE_SIZE;
        let last = page.iter().map(|u| u.update_id).max();

        for update in page {
            if let Some(post) = update.channel_post {
                self.posts.insert(update.update_id, post);
            }
        }

        match last {
            Some(last) if full => {
                self.offset = Some(last + 1);
                true
            }
            _ => false,
        }
    }

    /// Forget posts that `source` has handled and posts Telegram has expired
    fn prune(&mut self, source: &SourceRef, after: Option<&ItemId>, now: DateTime<Utc>) {
        let horizon = (now - Duration::hours(RETENTION_HOURS)).timestamp();
        self.posts.retain(|_, post| {
            let handled = post.chat.matches(source)
                && after
                    .map(|cursor| ItemId::Num(post.message_id) <= *cursor)
                    .unwrap_or(false);
            post.date >= horizon && !handled
        });
    }
}

impl TelegramSource {
    /// Create a new Telegram source
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            buffer: Mutex::new(PostBuffer::default()),
        }
    }

    /// Point at a different API host (e.g. a local Bot API server)
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    async fn fetch_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut body = serde_json::json!({
            "allowed_updates": ["channel_post"],
            "limit": PAGE_SIZE,
        });
        if let Some(offset) = offset {
            body["offset"] = offset.into();
        }

        let response = self
            .client
            .post(self.api_url("getUpdates"))
            .json(&body)
            .send()
            .await
            .context("Failed to fetch Telegram updates")?;

        let result: TelegramResponse<Vec<Update>> = response
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !result.ok {
            anyhow::bail!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            );
        }

        Ok(result.result.unwrap_or_default())
    }
}

/// Channel posts for `source` newer than `after`, oldest first
fn posts_for<'a>(
    posts: impl IntoIterator<Item = &'a ChannelPost>,
    source: &SourceRef,
    after: Option<&ItemId>,
) -> Vec<Item> {
    let mut items: Vec<Item> = posts
        .into_iter()
        .filter(|post| post.chat.matches(source))
        .map(|post| {
            let observed_at = DateTime::<Utc>::from_timestamp(post.date, 0).unwrap_or_else(Utc::now);
            let payload = post
                .text
                .clone()
                .or_else(|| post.caption.clone())
                .unwrap_or_default();
            Item {
                source: source.clone(),
                id: ItemId::Num(post.message_id),
                payload,
                attachment: None,
                observed_at,
            }
        })
        .filter(|item| after.map(|cursor| item.id > *cursor).unwrap_or(true))
        .collect();

    items.sort_by(|a, b| a.id.cmp(&b.id));
    items.dedup_by(|a, b| a.id == b.id);
    items
}

#[async_trait]
impl Source for TelegramSource {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn poll(&self, source: &SourceRef, after: Option<&ItemId>) -> Result<Vec<Item>> {
        let mut buffer = self.buffer.lock().await;

        let mut pages = 0;
        loop {
            let page = self.fetch_updates(buffer.offset).await?;
            pages += 1;
            if !buffer.absorb(page) {
                break;
            }
            if pages >= MAX_PAGES_PER_POLL {
                debug!(source = %source, pages, "More updates pending, continuing next poll");
                break;
            }
        }

        buffer.prune(source, after, Utc::now());
        Ok(posts_for(buffer.posts.values(), source, after))
    }
}
