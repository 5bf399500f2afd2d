//! Message model and timeline ordering.
//!
//! The timeline is the single ordered view of the conversation. Messages reach
//! it from three producers (history load, live push, local send); `merge` is the
//! one place ordering and duplicate collapse happen.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Format the backend uses for naive datetime strings (history and push).
pub const SERVER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Who authored a message: the driver (requests) or the dispatcher (responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Driver,
    Dispatcher,
}

impl Sender {
    /// Tie-break rank at equal timestamps: a request sorts before a response.
    fn sort_rank(self) -> u8 {
        match self {
            Sender::Driver => 0,
            Sender::Dispatcher => 1,
        }
    }
}

/// A single conversation message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub sender: Sender,
}

impl Message {
    pub fn driver(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            timestamp,
            sender: Sender::Driver,
        }
    }

    pub fn dispatcher(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            timestamp,
            sender: Sender::Dispatcher,
        }
    }
}

/// Parse a server-formatted naive datetime string. Naive strings are UTC; the
/// result is the absolute instant every producer must normalize to before any
/// comparison.
pub fn parse_server_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s.trim(), SERVER_TIME_FORMAT).map(|n| n.and_utc())
}

/// Total order over messages: timestamp ascending, request before response on
/// ties, text as a final key so a fixed message set has one canonical order
/// regardless of merge call order.
fn compare(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.sender.sort_rank().cmp(&b.sender.sort_rank()))
        .then_with(|| a.text.cmp(&b.text))
}

/// Ordered sequence of messages. Derived state: rebuilt by `merge`, never
/// mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Insert `incoming` into `existing` and return a new sorted timeline. Pure:
/// the caller's copy is untouched, so producers racing a merge can only
/// interleave, never corrupt. Fully identical entries (same text, timestamp,
/// sender) collapse to one, the strongest dedup possible without a
/// server-assigned message id.
pub fn merge(existing: &Timeline, incoming: impl IntoIterator<Item = Message>) -> Timeline {
    let mut messages = existing.messages.clone();
    messages.extend(incoming);
    messages.sort_by(compare);
    messages.dedup();
    Timeline { messages }
}

/// Shared timeline handle: the single serialization point for insertions from
/// history load, push receive, and local send.
#[derive(Clone, Default)]
pub struct TimelineStore {
    inner: Arc<RwLock<Timeline>>,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge messages in, one producer at a time; returns the merged snapshot.
    pub async fn merge_in(&self, incoming: impl IntoIterator<Item = Message>) -> Timeline {
        let mut g = self.inner.write().await;
        let merged = merge(&g, incoming);
        *g = merged.clone();
        merged
    }

    /// Current ordered view.
    pub async fn snapshot(&self) -> Timeline {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        parse_server_time(s).expect("test timestamp")
    }

    #[test]
    fn parse_server_time_is_utc() {
        let t = parse_server_time("2024-01-01 10:00:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-01T10:00:00+00:00");
    }

    #[test]
    fn parse_server_time_rejects_garbage() {
        assert!(parse_server_time("yesterday").is_err());
        assert!(parse_server_time("2024-01-01T10:00:00Z").is_err());
    }

    #[test]
    fn merge_orders_by_timestamp() {
        let t = merge(
            &Timeline::new(),
            vec![
                Message::dispatcher("later", at("2024-01-01 10:00:05")),
                Message::driver("earlier", at("2024-01-01 10:00:00")),
            ],
        );
        let texts: Vec<&str> = t.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["earlier", "later"]);
    }

    #[test]
    fn request_sorts_before_response_on_tie() {
        let instant = at("2024-01-01 10:00:00");
        let t = merge(
            &Timeline::new(),
            vec![
                Message::dispatcher("response", instant),
                Message::driver("request", instant),
            ],
        );
        assert_eq!(t.messages()[0].sender, Sender::Driver);
        assert_eq!(t.messages()[1].sender, Sender::Dispatcher);
    }

    #[test]
    fn merge_is_permutation_invariant() {
        let set = vec![
            Message::driver("a", at("2024-01-01 10:00:00")),
            Message::dispatcher("b", at("2024-01-01 10:00:05")),
            Message::driver("c", at("2024-01-01 10:00:05")),
            Message::dispatcher("d", at("2024-01-01 09:59:59")),
        ];
        // One big merge vs. one-at-a-time in reversed order.
        let all_at_once = merge(&Timeline::new(), set.clone());
        let mut one_by_one = Timeline::new();
        for m in set.into_iter().rev() {
            one_by_one = merge(&one_by_one, [m]);
        }
        assert_eq!(all_at_once, one_by_one);
    }

    #[test]
    fn merge_does_not_mutate_existing() {
        let existing = merge(
            &Timeline::new(),
            [Message::driver("a", at("2024-01-01 10:00:00"))],
        );
        let _ = merge(
            &existing,
            [Message::dispatcher("b", at("2024-01-01 10:00:05"))],
        );
        assert_eq!(existing.len(), 1);
    }

    #[test]
    fn merge_collapses_identical_entries() {
        let m = Message::driver("a", at("2024-01-01 10:00:00"));
        let t = merge(&Timeline::new(), [m.clone(), m.clone()]);
        assert_eq!(t.len(), 1);
        // Same text, different instant: two distinct messages.
        let t = merge(&t, [Message::driver("a", at("2024-01-01 10:00:01"))]);
        assert_eq!(t.len(), 2);
    }

    #[tokio::test]
    async fn store_serializes_concurrent_merges() {
        let store = TimelineStore::new();
        store
            .merge_in([Message::dispatcher("push", at("2024-01-01 10:00:05"))])
            .await;
        store
            .merge_in([Message::driver("history", at("2024-01-01 10:00:00"))])
            .await;
        let snap = store.snapshot().await;
        let texts: Vec<&str> = snap.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["history", "push"]);
    }
}
