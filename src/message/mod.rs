//! Message values and the id / receipt-handle namespace.
//!
//! A message id has the form
//! `<queueHash>_<shard>_<partition>:<timeToken>:<nodeToken>` where the
//! partition key prefix pins the message to its queue/shard/partition and
//! the zero-padded time token makes ids sort time-ascending within a
//! partition. Receipt handles are drawn from the same namespace: the
//! handle returned by a receive is the id of the message instance it
//! names.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use md5::{Digest, Md5};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of the millisecond component of a time token.
const TIME_TOKEN_MILLIS_WIDTH: usize = 13;
/// Width of the sequence suffix of a time token.
const TIME_TOKEN_SEQ_WIDTH: usize = 6;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("malformed message id: {0}")]
    Malformed(String),
}

/// First 8 hex chars of the md5 of a queue URL; the queue component of
/// every partition key.
pub fn queue_hash(queue_url: &str) -> String {
    let digest = Md5::digest(queue_url.as_bytes());
    digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Structured form of a message id / receipt handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub queue_hash: String,
    pub shard: u32,
    pub partition: u32,
    /// Zero-padded millis + sequence; lexicographic order is time order.
    pub time_token: String,
    pub node_token: String,
}

impl MessageId {
    pub fn partition_key(&self) -> String {
        format!("{}_{}_{}", self.queue_hash, self.shard, self.partition)
    }

    /// Millisecond timestamp encoded in the time token.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.time_token
            .get(..TIME_TOKEN_MILLIS_WIDTH)
            .and_then(|t| t.parse().ok())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}:{}:{}",
            self.queue_hash, self.shard, self.partition, self.time_token, self.node_token
        )
    }
}

impl FromStr for MessageId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(IdParseError::Malformed(s.to_string()));
        }

        let key_parts: Vec<&str> = parts[0].split('_').collect();
        if key_parts.len() != 3 {
            return Err(IdParseError::Malformed(s.to_string()));
        }

        let shard = key_parts[1]
            .parse()
            .map_err(|_| IdParseError::Malformed(s.to_string()))?;
        let partition = key_parts[2]
            .parse()
            .map_err(|_| IdParseError::Malformed(s.to_string()))?;

        if key_parts[0].is_empty() || parts[1].is_empty() || parts[2].is_empty() {
            return Err(IdParseError::Malformed(s.to_string()));
        }

        Ok(MessageId {
            queue_hash: key_parts[0].to_string(),
            shard,
            partition,
            time_token: parts[1].to_string(),
            node_token: parts[2].to_string(),
        })
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A parsed receipt handle.
///
/// The legacy form `<timestamp>:<shard>:<originalId>` predates partition
/// keys; it is accepted so handles issued before an upgrade keep working,
/// but never generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptHandle {
    Current(MessageId),
    Legacy {
        timestamp_ms: i64,
        shard: u32,
        original_id: String,
    },
}

impl ReceiptHandle {
    pub fn parse(raw: &str) -> Result<Self, IdParseError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(IdParseError::Malformed(raw.to_string()));
        }

        // Legacy handles lead with a bare numeric timestamp; current ones
        // lead with an underscore-joined partition key.
        if !parts[0].contains('_') {
            let timestamp_ms = parts[0]
                .parse()
                .map_err(|_| IdParseError::Malformed(raw.to_string()))?;
            let shard = parts[1]
                .parse()
                .map_err(|_| IdParseError::Malformed(raw.to_string()))?;
            if parts[2].is_empty() {
                return Err(IdParseError::Malformed(raw.to_string()));
            }
            return Ok(ReceiptHandle::Legacy {
                timestamp_ms,
                shard,
                original_id: parts[2].to_string(),
            });
        }

        raw.parse().map(ReceiptHandle::Current)
    }

    /// Canonical key used to look the handle up in the hidden set.
    pub fn lookup_key(&self) -> String {
        match self {
            ReceiptHandle::Current(id) => id.to_string(),
            ReceiptHandle::Legacy {
                timestamp_ms,
                shard,
                original_id,
            } => format!("{}:{}:{}", timestamp_ms, shard, original_id),
        }
    }
}

/// Generator for sortable message ids.
///
/// The sequence suffix disambiguates ids minted within one millisecond on
/// one node; uniqueness across nodes comes from the node token.
pub struct IdGenerator {
    node_id: String,
    seq: AtomicU64,
}

impl IdGenerator {
    pub fn new(node_id: impl Into<String>) -> Self {
        // The node token must not collide with the id delimiter
        let node_id = node_id.into().replace(':', "-");
        Self {
            node_id,
            seq: AtomicU64::new(0),
        }
    }

    pub fn next(&self, queue_url: &str, shard: u32, partition: u32) -> MessageId {
        let millis = Utc::now().timestamp_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        MessageId {
            queue_hash: queue_hash(queue_url),
            shard,
            partition,
            time_token: format!(
                "{:0mw$}{:0sw$}",
                millis,
                seq,
                mw = TIME_TOKEN_MILLIS_WIDTH,
                sw = TIME_TOKEN_SEQ_WIDTH
            ),
            node_token: self.node_id.clone(),
        }
    }
}

/// System attributes the service maintains on every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAttributes {
    /// Caller identity recorded at send time, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub sent_timestamp_ms: i64,
    pub approximate_receive_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_first_receive_timestamp_ms: Option<i64>,
}

impl SystemAttributes {
    pub fn at_send(sender_id: Option<String>) -> Self {
        Self {
            sender_id,
            sent_timestamp_ms: Utc::now().timestamp_millis(),
            approximate_receive_count: 0,
            approximate_first_receive_timestamp_ms: None,
        }
    }

    /// Record one delivery. The first-receive timestamp is set once and
    /// then preserved across redeliveries.
    pub fn record_receive(&mut self) {
        self.approximate_receive_count += 1;
        if self.approximate_first_receive_timestamp_ms.is_none() {
            self.approximate_first_receive_timestamp_ms = Some(Utc::now().timestamp_millis());
        }
    }
}

/// A queue message as stored in the cache and durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: String,
    pub md5_of_body: String,
    pub attributes: SystemAttributes,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub message_attributes: HashMap<String, String>,
    /// Client-supplied id when the message arrived in a batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_entry_id: Option<String>,
    /// Initial delivery delay in seconds, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
}

impl Message {
    pub fn new(
        id: MessageId,
        body: String,
        sender_id: Option<String>,
        message_attributes: HashMap<String, String>,
    ) -> Self {
        let md5_of_body = {
            let digest = Md5::digest(body.as_bytes());
            digest.iter().map(|b| format!("{:02x}", b)).collect()
        };
        Self {
            id,
            body,
            md5_of_body,
            attributes: SystemAttributes::at_send(sender_id),
            message_attributes,
            batch_entry_id: None,
            delay_seconds: None,
        }
    }

    /// Receipt handle for this message instance: the id itself.
    pub fn receipt_handle(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> IdGenerator {
        IdGenerator::new("node-1")
    }

    #[test]
    fn test_id_roundtrip() {
        let id = generator().next("/123/orders", 2, 7);
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.shard, 2);
        assert_eq!(parsed.partition, 7);
        assert_eq!(parsed.queue_hash, queue_hash("/123/orders"));
    }

    #[test]
    fn test_ids_sort_time_ascending_within_partition() {
        let generator = generator();
        let a = generator.next("/123/orders", 0, 0);
        let b = generator.next("/123/orders", 0, 0);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_timestamp_recovered_from_token() {
        let before = Utc::now().timestamp_millis();
        let id = generator().next("/123/orders", 0, 0);
        let ts = id.timestamp_ms().unwrap();
        assert!(ts >= before && ts <= Utc::now().timestamp_millis());
    }

    #[test]
    fn test_legacy_handle_parses() {
        let handle = ReceiptHandle::parse("1339712890000:3:a8f2c1").unwrap();
        match handle {
            ReceiptHandle::Legacy {
                timestamp_ms,
                shard,
                original_id,
            } => {
                assert_eq!(timestamp_ms, 1339712890000);
                assert_eq!(shard, 3);
                assert_eq!(original_id, "a8f2c1");
            }
            other => panic!("expected legacy handle, got {:?}", other),
        }
    }

    #[test]
    fn test_current_handle_parses() {
        let id = generator().next("/123/orders", 1, 2);
        let handle = ReceiptHandle::parse(&id.to_string()).unwrap();
        assert_eq!(handle, ReceiptHandle::Current(id.clone()));
        assert_eq!(handle.lookup_key(), id.to_string());
    }

    #[test]
    fn test_malformed_handles_rejected() {
        assert!(ReceiptHandle::parse("").is_err());
        assert!(ReceiptHandle::parse("no-delimiters").is_err());
        assert!(ReceiptHandle::parse("a:b").is_err());
        assert!(ReceiptHandle::parse("notdigits:3:x").is_err());
        assert!(ReceiptHandle::parse("1339712890000:notdigits:x").is_err());
    }

    #[test]
    fn test_node_token_colons_are_sanitized() {
        let generator = IdGenerator::new("host:8130");
        let id = generator.next("/123/orders", 0, 0);
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed.node_token, "host-8130");
    }

    #[test]
    fn test_message_md5_and_handle() {
        let id = generator().next("/123/orders", 0, 0);
        let msg = Message::new(id.clone(), "hello".into(), None, HashMap::new());
        // md5("hello")
        assert_eq!(msg.md5_of_body, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(msg.receipt_handle(), id.to_string());
    }

    #[test]
    fn test_record_receive_sets_first_receive_once() {
        let id = generator().next("/123/orders", 0, 0);
        let mut msg = Message::new(id, "x".into(), None, HashMap::new());
        msg.attributes.record_receive();
        let first = msg.attributes.approximate_first_receive_timestamp_ms;
        assert!(first.is_some());
        assert_eq!(msg.attributes.approximate_receive_count, 1);

        msg.attributes.record_receive();
        assert_eq!(msg.attributes.approximate_receive_count, 2);
        assert_eq!(msg.attributes.approximate_first_receive_timestamp_ms, first);
    }

    #[test]
    fn test_message_json_roundtrip() {
        let id = generator().next("/123/orders", 0, 1);
        let msg = Message::new(id, "payload".into(), Some("caller-1".into()), HashMap::new());
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.body, "payload");
        assert_eq!(back.attributes.sender_id.as_deref(), Some("caller-1"));
    }
}
