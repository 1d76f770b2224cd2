//! Visibility-timeout tracking.
//!
//! Every received message gets a hidden entry carrying its revisible-at
//! deadline; the sweeper task promotes expired entries back to the
//! visible set. A message is in exactly one of visible, hidden, or
//! deleted at any instant: the hidden entry owns the message value (with
//! its accumulated receive attributes) for the duration of the window.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;

use crate::message::Message;

/// A message held out of the visible set until its deadline.
#[derive(Debug, Clone)]
pub struct HiddenEntry {
    pub message: Message,
    pub revisible_at: DateTime<Utc>,
    pub hidden_at: DateTime<Utc>,
}

/// Per-queue hidden sets. The DashMap shards give per-queue locking; the
/// sweeper, receives, deletes, and visibility changes all mutate
/// concurrently without a global lock.
pub struct VisibilityTracker {
    hidden: DashMap<String, HashMap<String, HiddenEntry>>,
}

impl VisibilityTracker {
    pub fn new() -> Self {
        Self {
            hidden: DashMap::new(),
        }
    }

    /// Hide a message until `now + timeout_seconds`. The caller has
    /// already updated the receive attributes on the message value.
    pub fn hide(&self, queue_url: &str, message: Message, timeout_seconds: u32) {
        let now = Utc::now();
        let entry = HiddenEntry {
            revisible_at: now + Duration::seconds(i64::from(timeout_seconds)),
            hidden_at: now,
            message,
        };
        self.hidden
            .entry(queue_url.to_string())
            .or_default()
            .insert(entry.message.id.to_string(), entry);
    }

    /// Remove a hidden entry, completing the hidden→deleted transition
    /// (or hidden→visible when the caller re-enqueues the message).
    pub fn remove(&self, queue_url: &str, id: &str) -> Option<HiddenEntry> {
        let mut queue = self.hidden.get_mut(queue_url)?;
        queue.remove(id)
    }

    /// Rewrite the deadline of a still-hidden entry. Returns false when
    /// the id no longer names a hidden message (deleted or already
    /// promoted), which callers surface as ReceiptHandleInvalid.
    pub fn change_visibility(&self, queue_url: &str, id: &str, timeout_seconds: u32) -> bool {
        let Some(mut queue) = self.hidden.get_mut(queue_url) else {
            return false;
        };
        match queue.get_mut(id) {
            Some(entry) => {
                entry.revisible_at = Utc::now() + Duration::seconds(i64::from(timeout_seconds));
                true
            }
            None => false,
        }
    }

    pub fn is_hidden(&self, queue_url: &str, id: &str) -> bool {
        self.hidden
            .get(queue_url)
            .map(|q| q.contains_key(id))
            .unwrap_or(false)
    }

    pub fn hidden_count(&self, queue_url: &str) -> usize {
        self.hidden.get(queue_url).map(|q| q.len()).unwrap_or(0)
    }

    /// Remove and return every entry whose deadline has passed, ordered
    /// by id so promotion re-enters messages at their original position
    /// within the partition.
    pub fn take_expired(&self, queue_url: &str, now: DateTime<Utc>) -> Vec<Message> {
        let Some(mut queue) = self.hidden.get_mut(queue_url) else {
            return Vec::new();
        };

        let expired: Vec<String> = queue
            .iter()
            .filter(|(_, entry)| entry.revisible_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut promoted: Vec<Message> = expired
            .iter()
            .filter_map(|id| queue.remove(id))
            .map(|entry| entry.message)
            .collect();
        promoted.sort_by_key(|m| m.id.to_string());
        promoted
    }

    /// Drop every hidden entry for a queue (purge / queue delete).
    pub fn clear(&self, queue_url: &str) -> usize {
        self.hidden
            .remove(queue_url)
            .map(|(_, q)| q.len())
            .unwrap_or(0)
    }
}

impl Default for VisibilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IdGenerator;
    use std::collections::HashMap as StdHashMap;

    const QUEUE: &str = "/123/orders";

    // One shared generator keeps ids distinct within a test run; a fresh
    // generator per message could mint identical sequence numbers.
    fn generator() -> IdGenerator {
        IdGenerator::new("n1")
    }

    fn message_from(generator: &IdGenerator, body: &str) -> Message {
        Message::new(
            generator.next(QUEUE, 0, 0),
            body.to_string(),
            None,
            StdHashMap::new(),
        )
    }

    #[test]
    fn test_hide_and_remove() {
        let tracker = VisibilityTracker::new();
        let msg = message_from(&generator(), "x");
        let id = msg.id.to_string();

        tracker.hide(QUEUE, msg, 30);
        assert!(tracker.is_hidden(QUEUE, &id));
        assert_eq!(tracker.hidden_count(QUEUE), 1);

        let entry = tracker.remove(QUEUE, &id).unwrap();
        assert_eq!(entry.message.body, "x");
        assert!(!tracker.is_hidden(QUEUE, &id));
        assert!(tracker.remove(QUEUE, &id).is_none());
    }

    #[test]
    fn test_change_visibility_requires_hidden_entry() {
        let tracker = VisibilityTracker::new();
        let msg = message_from(&generator(), "x");
        let id = msg.id.to_string();

        assert!(!tracker.change_visibility(QUEUE, &id, 10));

        tracker.hide(QUEUE, msg, 30);
        assert!(tracker.change_visibility(QUEUE, &id, 10));

        tracker.remove(QUEUE, &id);
        assert!(!tracker.change_visibility(QUEUE, &id, 10));
    }

    #[test]
    fn test_take_expired_respects_deadlines() {
        let tracker = VisibilityTracker::new();
        let generator = generator();
        let expired = message_from(&generator, "old");
        let fresh = message_from(&generator, "new");
        let fresh_id = fresh.id.to_string();

        tracker.hide(QUEUE, expired, 0);
        tracker.hide(QUEUE, fresh, 300);

        let promoted = tracker.take_expired(QUEUE, Utc::now());
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].body, "old");
        assert!(tracker.is_hidden(QUEUE, &fresh_id));
    }

    #[test]
    fn test_take_expired_preserves_attributes() {
        let tracker = VisibilityTracker::new();
        let mut msg = message_from(&generator(), "x");
        msg.attributes.record_receive();
        msg.attributes.record_receive();
        let first = msg.attributes.approximate_first_receive_timestamp_ms;

        tracker.hide(QUEUE, msg, 0);
        let promoted = tracker.take_expired(QUEUE, Utc::now());
        assert_eq!(promoted[0].attributes.approximate_receive_count, 2);
        assert_eq!(
            promoted[0].attributes.approximate_first_receive_timestamp_ms,
            first
        );
    }

    #[test]
    fn test_take_expired_sorted_by_id() {
        let tracker = VisibilityTracker::new();
        let generator = generator();
        let a = message_from(&generator, "a");
        let b = message_from(&generator, "b");
        // Hide in reverse order; promotion must come back id-ordered
        tracker.hide(QUEUE, b.clone(), 0);
        tracker.hide(QUEUE, a.clone(), 0);

        let promoted = tracker.take_expired(QUEUE, Utc::now());
        assert_eq!(promoted.len(), 2);
        assert!(promoted[0].id.to_string() < promoted[1].id.to_string());
    }

    #[test]
    fn test_clear() {
        let tracker = VisibilityTracker::new();
        let generator = generator();
        tracker.hide(QUEUE, message_from(&generator, "a"), 30);
        tracker.hide(QUEUE, message_from(&generator, "b"), 30);
        assert_eq!(tracker.clear(QUEUE), 2);
        assert_eq!(tracker.hidden_count(QUEUE), 0);
    }
}
