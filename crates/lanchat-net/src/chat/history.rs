//! In-memory chat history: bounded, duplicate-suppressed, and kept in
//! chronological order.

use std::collections::HashSet;

use parking_lot::Mutex;

use lanchat_core::wire::{ChatKind, ChatMessage, HISTORY_CAPACITY};

pub struct MessageHistory {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Chronologically ordered messages.
    messages: Vec<ChatMessage>,
    /// Ids of everything in `messages`, for O(1) duplicate detection.
    seen: HashSet<String>,
    capacity: usize,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStats {
    pub total: usize,
    pub capacity: usize,
    pub unique_ids: usize,
}

impl MessageHistory {
    /// `capacity` 0 selects the default of 1000.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { HISTORY_CAPACITY } else { capacity };
        Self {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                seen: HashSet::new(),
                capacity,
            }),
        }
    }

    /// Store a message. Returns whether it was stored: heartbeats and
    /// duplicate ids are suppressed, and when the log overflows the oldest
    /// entries are dropped from both the sequence and the id set.
    pub fn add(&self, msg: ChatMessage) -> bool {
        if msg.kind == ChatKind::Heartbeat {
            return false;
        }

        let inner = &mut *self.inner.lock();
        if inner.seen.contains(&msg.id) {
            tracing::trace!(id = %msg.id, "duplicate message suppressed");
            return false;
        }

        inner.seen.insert(msg.id.clone());
        inner.messages.push(msg);
        // Stable sort: equal timestamps keep insertion order.
        inner.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        if inner.messages.len() > inner.capacity {
            let excess = inner.messages.len() - inner.capacity;
            let dropped: Vec<String> = inner
                .messages
                .drain(..excess)
                .map(|old| old.id)
                .collect();
            for id in dropped {
                inner.seen.remove(&id);
            }
            tracing::debug!(excess, remaining = inner.messages.len(), "trimmed history");
        }
        true
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().messages.clone()
    }

    /// The most recent `limit` messages; everything if `limit` is 0 or
    /// larger than the log.
    pub fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let inner = self.inner.lock();
        if limit == 0 || limit >= inner.messages.len() {
            return inner.messages.clone();
        }
        inner.messages[inner.messages.len() - limit..].to_vec()
    }

    pub fn of_kind(&self, kind: ChatKind) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    pub fn clear(&self) {
        let inner = &mut *self.inner.lock();
        inner.messages.clear();
        inner.seen.clear();
        tracing::debug!("history cleared");
    }

    pub fn stats(&self) -> HistoryStats {
        let inner = self.inner.lock();
        HistoryStats {
            total: inner.messages.len(),
            capacity: inner.capacity,
            unique_ids: inner.seen.len(),
        }
    }
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn msg_at(id: &str, offset_secs: i64) -> ChatMessage {
        let mut msg = ChatMessage::chat("alice_1", "alice", "hello", 1);
        msg.id = id.to_string();
        msg.timestamp = Utc::now() + Duration::seconds(offset_secs);
        msg
    }

    #[test]
    fn duplicate_ids_are_stored_once() {
        let history = MessageHistory::new(10);
        let msg = msg_at("aaaa", 0);
        assert!(history.add(msg.clone()));
        assert!(!history.add(msg));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn heartbeats_are_never_stored() {
        let history = MessageHistory::new(10);
        let hb = ChatMessage::heartbeat("alice_1", "alice", 1);
        assert!(!history.add(hb.clone()));
        assert!(history.is_empty());
        assert!(!history.contains(&hb.id));
    }

    #[test]
    fn messages_stay_chronologically_sorted() {
        let history = MessageHistory::new(10);
        history.add(msg_at("cccc", 20));
        history.add(msg_at("aaaa", 0));
        history.add(msg_at("bbbb", 10));

        let ids: Vec<_> = history.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["aaaa", "bbbb", "cccc"]);

        let timestamps: Vec<_> = history.messages().iter().map(|m| m.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn overflow_drops_the_oldest_from_both_structures() {
        let history = MessageHistory::new(3);
        for (i, id) in ["a1", "a2", "a3", "a4", "a5"].iter().enumerate() {
            history.add(msg_at(id, i as i64));
        }

        assert_eq!(history.len(), 3);
        let ids: Vec<_> = history.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["a3", "a4", "a5"]);

        // evicted ids are forgotten by the dedup set too
        assert!(!history.contains("a1"));
        assert!(!history.contains("a2"));
        assert!(history.contains("a3"));

        let stats = history.stats();
        assert_eq!(stats.total, stats.unique_ids);
        assert_eq!(stats.capacity, 3);
    }

    #[test]
    fn recent_returns_the_tail() {
        let history = MessageHistory::new(10);
        for (i, id) in ["a1", "a2", "a3"].iter().enumerate() {
            history.add(msg_at(id, i as i64));
        }

        let ids: Vec<_> = history.recent(2).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["a2", "a3"]);
        assert_eq!(history.recent(0).len(), 3);
        assert_eq!(history.recent(99).len(), 3);
    }

    #[test]
    fn of_kind_filters() {
        let history = MessageHistory::new(10);
        history.add(msg_at("chat1", 0));
        let mut join = ChatMessage::join("bob_1", "bob", 1);
        join.id = "join1".to_string();
        history.add(join);

        assert_eq!(history.of_kind(ChatKind::Chat).len(), 1);
        assert_eq!(history.of_kind(ChatKind::Join).len(), 1);
        assert_eq!(history.of_kind(ChatKind::Leave).len(), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let history = MessageHistory::new(10);
        history.add(msg_at("aaaa", 0));
        history.clear();
        assert!(history.is_empty());
        assert!(!history.contains("aaaa"));
        // the same id can be stored again after a clear
        assert!(history.add(msg_at("aaaa", 0)));
    }

    #[test]
    fn zero_capacity_selects_the_default() {
        let history = MessageHistory::new(0);
        assert_eq!(history.stats().capacity, HISTORY_CAPACITY);
    }
}
