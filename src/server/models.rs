//! Request and response bodies for the JSON API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, SystemAttributes};
use crate::queue::QueueAttributeUpdate;

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Option<QueueAttributeUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub delay_seconds: Option<u32>,
    #[serde(default)]
    pub message_attributes: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub md5_of_body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBatchRequest {
    pub entries: Vec<SendMessageBatchEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBatchEntry {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub delay_seconds: Option<u32>,
    #[serde(default)]
    pub message_attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReceiveMessageRequest {
    #[serde(default)]
    pub max_number_of_messages: Option<usize>,
    #[serde(default)]
    pub visibility_timeout: Option<u32>,
    #[serde(default)]
    pub wait_time_seconds: Option<u32>,
}

/// A delivered message, receipt handle included.
#[derive(Debug, Serialize)]
pub struct MessageView {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: String,
    pub attributes: SystemAttributes,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub message_attributes: HashMap<String, String>,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.id.to_string(),
            receipt_handle: message.receipt_handle(),
            body: message.body,
            md5_of_body: message.md5_of_body,
            attributes: message.attributes,
            message_attributes: message.message_attributes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReceiveMessageResponse {
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageRequest {
    pub receipt_handle: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeVisibilityRequest {
    pub receipt_handle: String,
    pub visibility_timeout: u32,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageBatchRequest {
    pub entries: Vec<DeleteMessageBatchEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageBatchEntry {
    pub id: String,
    pub receipt_handle: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeVisibilityBatchRequest {
    pub entries: Vec<ChangeVisibilityBatchRequestEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeVisibilityBatchRequestEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: u32,
}

#[derive(Debug, Deserialize)]
pub struct PeekQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PeekResponse {
    pub messages: Vec<MessageView>,
    /// Pass back as `cursor` to resume after the last message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueCountResponse {
    pub approximate_number_of_messages: usize,
}

#[derive(Debug, Deserialize)]
pub struct HeadQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HeadIdsResponse {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PurgeQueueResponse {
    pub purged: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}
