//! Identity Tracker Integration Tests
//!
//! Tests for cursor and bounded-set deduplication.

use chanwatch::domain::{IdentityTracker, ItemId, SetBounds, SourceRef, TrackingMode};

fn chan(name: &str) -> SourceRef {
    SourceRef::from(name)
}

#[test]
fn test_cursor_starts_at_zero() {
    let tracker = IdentityTracker::cursor();
    assert_eq!(tracker.mode(), TrackingMode::Cursor);
    assert!(tracker.is_new(&chan("a"), &ItemId::Num(1)));
    assert!(!tracker.is_new(&chan("a"), &ItemId::Num(0)));
    assert_eq!(tracker.poll_hint(&chan("a")), None);
}

#[test]
fn test_cursor_never_moves_backwards() {
    let mut tracker = IdentityTracker::cursor();
    let source = chan("news");

    tracker.mark_done(&source, &ItemId::Num(103));
    tracker.mark_done(&source, &ItemId::Num(101));

    assert_eq!(tracker.poll_hint(&source), Some(&ItemId::Num(103)));
    assert!(!tracker.is_new(&source, &ItemId::Num(102)));
    assert!(!tracker.is_new(&source, &ItemId::Num(103)));
    assert!(tracker.is_new(&source, &ItemId::Num(104)));
}

#[test]
fn test_cursor_sources_are_independent() {
    let mut tracker = IdentityTracker::cursor();
    tracker.mark_done(&chan("a"), &ItemId::Num(500));

    assert!(tracker.is_new(&chan("b"), &ItemId::Num(1)));
    assert_eq!(tracker.source_count(), 1);
}

#[test]
fn test_cursor_processes_in_order() {
    // Cursor at 100, items 101..=103 arrive oldest first
    let mut tracker = IdentityTracker::cursor();
    let source = chan("news");
    tracker.mark_done(&source, &ItemId::Num(100));

    let mut handled = Vec::new();
    for id in [101, 102, 103] {
        let id = ItemId::Num(id);
        assert!(tracker.is_new(&source, &id));
        tracker.mark_done(&source, &id);
        handled.push(id);
    }

    assert_eq!(handled, vec![ItemId::Num(101), ItemId::Num(102), ItemId::Num(103)]);
    assert_eq!(tracker.poll_hint(&source), Some(&ItemId::Num(103)));
}

#[test]
fn test_set_marks_text_ids() {
    let mut tracker = IdentityTracker::set(SetBounds::default());
    let source = chan("C09");
    let ts1 = ItemId::from("ts1");

    assert!(tracker.is_new(&source, &ts1));
    tracker.mark_done(&source, &ts1);
    assert!(!tracker.is_new(&source, &ts1));
    assert_eq!(tracker.handled(&source).map(|ids| ids.len()), Some(1));
}

#[test]
fn test_set_duplicate_mark_is_noop() {
    let mut tracker = IdentityTracker::set(SetBounds::default());
    let source = chan("C09");

    tracker.mark_done(&source, &ItemId::from("ts1"));
    tracker.mark_done(&source, &ItemId::from("ts1"));

    assert_eq!(tracker.handled(&source).map(|ids| ids.len()), Some(1));
}

#[test]
fn test_set_holds_up_to_max_len() {
    let mut tracker = IdentityTracker::set(SetBounds::default());
    let source = chan("C09");

    for i in 0..50 {
        tracker.mark_done(&source, &ItemId::Text(format!("{}.000100", 1_700_000_000 + i)));
    }

    assert_eq!(tracker.handled(&source).map(|ids| ids.len()), Some(50));
}

#[test]
fn test_set_overflow_keeps_most_recent_twenty() {
    let mut tracker = IdentityTracker::set(SetBounds::default());
    let source = chan("C09");

    let ids: Vec<ItemId> = (0..51)
        .map(|i| ItemId::Text(format!("{}.000100", 1_700_000_000 + i)))
        .collect();
    for id in &ids[..50] {
        tracker.mark_done(&source, id);
    }
    tracker.mark_done(&source, &ids[50]);

    let handled: Vec<ItemId> = tracker
        .handled(&source)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default();
    assert_eq!(handled.len(), 20);
    assert_eq!(handled, ids[31..].to_vec());

    // Evicted ids look new again
    assert!(tracker.is_new(&source, &ids[0]));
    assert!(!tracker.is_new(&source, &ids[50]));
}

#[test]
fn test_set_custom_bounds() {
    let mut tracker = IdentityTracker::set(SetBounds {
        max_len: 5,
        retain: 2,
    });
    let source = chan("C09");

    for i in 0..6 {
        tracker.mark_done(&source, &ItemId::Num(i));
    }

    let handled: Vec<ItemId> = tracker
        .handled(&source)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default();
    assert_eq!(handled, vec![ItemId::Num(4), ItemId::Num(5)]);
}

#[test]
fn test_tracker_serializes_with_kind() {
    let mut tracker = IdentityTracker::set(SetBounds::default());
    tracker.mark_done(&chan("C09"), &ItemId::from("1712345678.000100"));

    let json = serde_json::to_string(&tracker).unwrap();
    assert!(json.contains(r#""kind":"set""#));

    let parsed: IdentityTracker = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, tracker);
}

#[test]
fn test_describe_summaries() {
    let mut tracker = IdentityTracker::cursor();
    tracker.mark_done(&chan("news"), &ItemId::Num(42));

    let summary = tracker.describe();
    assert_eq!(summary, vec![(chan("news"), "cursor 42".to_string())]);
}
