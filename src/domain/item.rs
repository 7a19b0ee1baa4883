//! Items observed on a monitored source and the results of handling them.
//!
//! Items are produced by a `Source` poll and never mutated afterwards.
//! Everything downstream (transform, delivery, bookkeeping) works on
//! borrowed items and returns explicit result values.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle for one monitored source (channel id or username)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(String);

impl SourceRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Totally ordered item identifier.
///
/// Telegram message ids are integers; Slack message timestamps are
/// monotonically increasing strings such as `"1712345678.123456"`.
/// Numeric ids always sort before textual ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Num(i64),
    Text(String),
}

impl ItemId {
    /// Lowest possible cursor value; an absent cursor behaves like this
    pub const ZERO: ItemId = ItemId::Num(0);
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ItemId::Num(a), ItemId::Num(b)) => a.cmp(b),
            (ItemId::Text(a), ItemId::Text(b)) => cmp_text_ids(a, b),
            (ItemId::Num(_), ItemId::Text(_)) => Ordering::Less,
            (ItemId::Text(_), ItemId::Num(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare decimal timestamps numerically when both parse, so that
/// `"9.5"` sorts before `"10.1"`; otherwise fall back to byte order.
fn cmp_text_ids(a: &str, b: &str) -> Ordering {
    match (split_decimal(a), split_decimal(b)) {
        (Some((ai, af)), Some((bi, bf))) => ai
            .len()
            .cmp(&bi.len())
            .then_with(|| ai.cmp(bi))
            .then_with(|| af.cmp(bf))
            .then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn split_decimal(s: &str) -> Option<(&str, &str)> {
    let (int, frac) = s.split_once('.').unwrap_or((s, ""));
    let digits = |p: &str| p.bytes().all(|c| c.is_ascii_digit());
    if int.is_empty() || !digits(int) || !digits(frac) {
        return None;
    }
    Some((int.trim_start_matches('0'), frac))
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Num(n) => write!(f, "{}", n),
            ItemId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        ItemId::Num(value)
    }
}

impl From<i32> for ItemId {
    fn from(value: i32) -> Self {
        ItemId::Num(value.into())
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId::Text(value.to_string())
    }
}

/// One unit of source content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Source the item was observed on
    pub source: SourceRef,

    /// Ordered identifier, unique within the source
    pub id: ItemId,

    /// Message text
    pub payload: String,

    /// Optional binary attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Vec<u8>>,

    /// When the source reported the item
    pub observed_at: DateTime<Utc>,
}

impl Item {
    pub fn new(source: SourceRef, id: impl Into<ItemId>, payload: impl Into<String>) -> Self {
        Self {
            source,
            id: id.into(),
            payload: payload.into(),
            attachment: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_attachment(mut self, bytes: Vec<u8>) -> Self {
        self.attachment = Some(bytes);
        self
    }
}

/// Fully formed content ready for a sink
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    /// Source the content originates from (sinks may label with it)
    pub source: SourceRef,

    pub text: String,

    pub attachment: Option<Vec<u8>>,
}

impl Content {
    pub fn new(source: SourceRef, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            attachment: None,
        }
    }

    /// Content derived from an item, carrying its attachment along
    pub fn from_item(item: &Item, text: impl Into<String>) -> Self {
        Self {
            source: item.source.clone(),
            text: text.into(),
            attachment: item.attachment.clone(),
        }
    }
}

/// Result of running a transform on one item
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Forward this content to the sink
    Deliver(Content),

    /// Inspected and intentionally dropped; still marked handled
    Suppress,

    /// Transform failed; the item stays unmarked
    Fail(String),
}

/// Result of a sink delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Fail(String),
}

/// How a handled item left the loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Delivered,
    Suppressed,
    /// Dropped after repeatedly failing
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ids_order() {
        assert!(ItemId::Num(101) > ItemId::Num(100));
        assert!(ItemId::Num(5) > ItemId::ZERO);
    }

    #[test]
    fn test_timestamp_ids_order_numerically() {
        let a = ItemId::from("999999999.000100");
        let b = ItemId::from("1712345678.000001");
        let c = ItemId::from("1712345678.000002");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_text_sorts_after_numbers() {
        assert!(ItemId::from("ts1") > ItemId::ZERO);
    }

    #[test]
    fn test_item_id_serde_is_untagged() {
        let num: ItemId = serde_json::from_str("42").unwrap();
        let text: ItemId = serde_json::from_str("\"1712345678.1\"").unwrap();
        assert_eq!(num, ItemId::Num(42));
        assert_eq!(text, ItemId::from("1712345678.1"));
        assert_eq!(serde_json::to_string(&num).unwrap(), "42");
    }
}
