//! The queue service: action-level contract over the cache layer,
//! visibility tracker, and long-poll coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::batch::{validate_batch, BatchEntry, BatchResult, BatchResultError};
use crate::cache::CacheLayer;
use crate::config::{BatchConfig, LongPollConfig, QueueDefaults};
use crate::error::{QueueServiceError, Result};
use crate::longpoll::{QueueNotifier, WaitRegistry};
use crate::message::{IdGenerator, Message, MessageId, ReceiptHandle};
use crate::metrics::{
    LongPollMetrics, MESSAGES_DELETED_TOTAL, MESSAGES_RECEIVED_TOTAL, MESSAGES_SENT_TOTAL,
};
use crate::queue::{QueueAttributeUpdate, QueueInfo, QueueRegistry};

/// Upper bound SQS accepts for visibility timeouts: 12 hours.
const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;
/// Upper bound for per-message delays: 15 minutes.
const MAX_DELAY_SECONDS: u32 = 900;
/// Most messages one receive call may return.
const MAX_RECEIVE_MESSAGES: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct SendMessageParams {
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub message_attributes: HashMap<String, String>,
    /// Caller identity from the auth layer; recorded as an attribute.
    pub sender_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendMessageResult {
    pub message_id: MessageId,
    pub md5_of_body: String,
}

#[derive(Debug, Clone)]
pub struct SendBatchEntry {
    pub id: String,
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub message_attributes: HashMap<String, String>,
}

impl BatchEntry for SendBatchEntry {
    fn entry_id(&self) -> &str {
        &self.id
    }

    fn payload_size(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SendBatchSuccess {
    pub id: String,
    pub message_id: MessageId,
    pub md5_of_body: String,
}

#[derive(Debug, Clone)]
pub struct ReceiveMessageParams {
    pub max_messages: usize,
    pub visibility_timeout: Option<u32>,
    pub wait_time_seconds: Option<u32>,
}

impl Default for ReceiveMessageParams {
    fn default() -> Self {
        Self {
            max_messages: 1,
            visibility_timeout: None,
            wait_time_seconds: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteBatchEntry {
    pub id: String,
    pub receipt_handle: String,
}

impl BatchEntry for DeleteBatchEntry {
    fn entry_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone)]
pub struct ChangeVisibilityBatchEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: u32,
}

impl BatchEntry for ChangeVisibilityBatchEntry {
    fn entry_id(&self) -> &str {
        &self.id
    }
}

pub struct QueueService {
    registry: Arc<QueueRegistry>,
    cache: Arc<CacheLayer>,
    waiters: Arc<WaitRegistry>,
    notifier: Arc<dyn QueueNotifier>,
    ids: Arc<IdGenerator>,
    defaults: QueueDefaults,
    batch_limits: BatchConfig,
    longpoll: LongPollConfig,
    datacenter: String,
    shutdown: broadcast::Sender<()>,
}

impl QueueService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<QueueRegistry>,
        cache: Arc<CacheLayer>,
        waiters: Arc<WaitRegistry>,
        notifier: Arc<dyn QueueNotifier>,
        ids: Arc<IdGenerator>,
        defaults: QueueDefaults,
        batch_limits: BatchConfig,
        longpoll: LongPollConfig,
        datacenter: String,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            cache,
            waiters,
            notifier,
            ids,
            defaults,
            batch_limits,
            longpoll,
            datacenter,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn waiters(&self) -> &Arc<WaitRegistry> {
        &self.waiters
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    // ------------------------------------------------------------------
    // Queue administration
    // ------------------------------------------------------------------

    pub fn create_queue(
        &self,
        owner: &str,
        name: &str,
        attributes: Option<QueueAttributeUpdate>,
    ) -> Result<Arc<QueueInfo>> {
        validate_name(owner, "queue owner")?;
        validate_name(name, "queue name")?;

        let info = QueueInfo::new(owner, name, &self.datacenter, &self.defaults);
        let created = self.registry.create(info)?;
        match attributes {
            Some(update) => self.set_queue_attributes(&created.url, &update),
            None => Ok(created),
        }
    }

    pub fn get_queue(&self, queue_url: &str) -> Result<Arc<QueueInfo>> {
        self.registry.get(queue_url)
    }

    pub fn list_queues(&self) -> Vec<Arc<QueueInfo>> {
        self.registry.list()
    }

    pub fn set_queue_attributes(
        &self,
        queue_url: &str,
        update: &QueueAttributeUpdate,
    ) -> Result<Arc<QueueInfo>> {
        if let Some(v) = update.visibility_timeout_seconds {
            validate_visibility_timeout(v)?;
        }
        if let Some(v) = update.delay_seconds {
            validate_delay(v)?;
        }
        self.registry.update(queue_url, update)
    }

    /// Delete a queue and purge everything it holds.
    pub async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        let info = self.registry.get(queue_url)?;
        self.cache.clear_queue(queue_url).await?;
        self.registry.remove(queue_url)?;
        // Unblock anyone still long-polling the dead queue
        while self.waiters.notify_one(&info.arn) {}
        Ok(())
    }

    pub async fn purge_queue(&self, queue_url: &str) -> Result<usize> {
        self.registry.get(queue_url)?;
        self.cache.clear_queue(queue_url).await
    }

    pub async fn queue_message_count(&self, queue_url: &str) -> Result<usize> {
        self.registry.get(queue_url)?;
        self.cache.queue_message_count(queue_url).await
    }

    pub async fn ids_from_head(&self, queue_url: &str, limit: usize) -> Result<Vec<String>> {
        self.registry.get(queue_url)?;
        self.cache.ids_from_head(queue_url, limit).await
    }

    /// Non-destructive ordered page of a queue's messages. The cursor is
    /// the id of the last message of the previous page.
    pub async fn peek_queue(
        &self,
        queue_url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.registry.get(queue_url)?;
        if let Some(cursor) = cursor {
            cursor
                .parse::<MessageId>()
                .map_err(|_| QueueServiceError::Validation(format!("invalid cursor {:?}", cursor)))?;
        }
        self.cache.peek_queue(queue_url, cursor, limit.clamp(1, 1_000)).await
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    #[tracing::instrument(name = "service.send_message", skip(self, params), fields(queue = %queue_url))]
    pub async fn send_message(
        &self,
        queue_url: &str,
        params: SendMessageParams,
    ) -> Result<SendMessageResult> {
        let queue = self.registry.get(queue_url)?;
        let delay = params.delay_seconds.unwrap_or(queue.delay_seconds);
        validate_delay(delay)?;
        validate_body(&params.body, queue.max_message_bytes)?;

        let message = self.build_message(&queue, &params, delay, None);
        let result = SendMessageResult {
            message_id: message.id.clone(),
            md5_of_body: message.md5_of_body.clone(),
        };

        self.cache.send_message(queue_url, message, delay).await?;
        MESSAGES_SENT_TOTAL.inc();

        if delay == 0 {
            self.notify_arrival(&queue.arn);
        }
        Ok(result)
    }

    #[tracing::instrument(
        name = "service.send_message_batch",
        skip(self, entries),
        fields(queue = %queue_url, entries = entries.len())
    )]
    pub async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendBatchEntry>,
    ) -> Result<BatchResult<SendBatchSuccess>> {
        let queue = self.registry.get(queue_url)?;
        validate_batch(&entries, &self.batch_limits)?;

        let mut result = BatchResult::with_capacity(entries.len());
        let mut accepted: Vec<(Message, u32)> = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.body.is_empty() {
                result.failures.push(BatchResultError::sender(
                    &entry.id,
                    "EmptyValue",
                    "message body must not be empty",
                ));
                continue;
            }
            if entry.body.len() > queue.max_message_bytes {
                result.failures.push(BatchResultError::sender(
                    &entry.id,
                    "InvalidParameterValue",
                    format!("message body exceeds {} bytes", queue.max_message_bytes),
                ));
                continue;
            }
            let delay = entry.delay_seconds.unwrap_or(queue.delay_seconds);
            if delay > MAX_DELAY_SECONDS {
                result.failures.push(BatchResultError::sender(
                    &entry.id,
                    "InvalidParameterValue",
                    format!("delay exceeds {} seconds", MAX_DELAY_SECONDS),
                ));
                continue;
            }

            let params = SendMessageParams {
                body: entry.body,
                delay_seconds: Some(delay),
                message_attributes: entry.message_attributes,
                sender_id: None,
            };
            let message = self.build_message(&queue, &params, delay, Some(entry.id.clone()));
            result.successes.push(SendBatchSuccess {
                id: entry.id,
                message_id: message.id.clone(),
                md5_of_body: message.md5_of_body.clone(),
            });
            accepted.push((message, delay));
        }

        // The durable batch write gates success for every accepted entry
        let any_visible = accepted.iter().any(|(_, delay)| *delay == 0);
        if !accepted.is_empty() {
            MESSAGES_SENT_TOTAL.inc_by(accepted.len() as u64);
            self.cache.send_message_batch(queue_url, accepted).await?;
        }
        if any_visible {
            self.notify_arrival(&queue.arn);
        }
        Ok(result)
    }

    /// Receive up to `max_messages`, long-polling for up to the caller's
    /// wait time when the queue is empty. The call always completes by
    /// its deadline, with an empty result if nothing arrived.
    #[tracing::instrument(name = "service.receive_message", skip(self, params), fields(queue = %queue_url))]
    pub async fn receive_message(
        &self,
        queue_url: &str,
        params: ReceiveMessageParams,
    ) -> Result<Vec<Message>> {
        let queue = self.registry.get(queue_url)?;

        let max = params.max_messages;
        if max == 0 || max > MAX_RECEIVE_MESSAGES {
            return Err(QueueServiceError::Validation(format!(
                "maxNumberOfMessages must be 1..={}",
                MAX_RECEIVE_MESSAGES
            )));
        }
        let visibility = params
            .visibility_timeout
            .unwrap_or(queue.visibility_timeout_seconds);
        validate_visibility_timeout(visibility)?;
        let wait = params.wait_time_seconds.unwrap_or(queue.receive_wait_seconds);
        if wait > self.longpoll.max_wait_seconds {
            return Err(QueueServiceError::Validation(format!(
                "waitTimeSeconds must be 0..={}",
                self.longpoll.max_wait_seconds
            )));
        }

        let messages = self.cache.receive_message(queue_url, max, visibility).await?;
        if !messages.is_empty() || wait == 0 {
            MESSAGES_RECEIVED_TOTAL.inc_by(messages.len() as u64);
            return Ok(messages);
        }

        self.long_poll(&queue.arn, queue_url, max, visibility, wait).await
    }

    /// Suspend until a notification, the deadline, or shutdown. The
    /// worker is released while waiting; only the registered permit and
    /// this future's state persist.
    async fn long_poll(
        &self,
        arn: &str,
        queue_url: &str,
        max: usize,
        visibility: u32,
        wait_seconds: u32,
    ) -> Result<Vec<Message>> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(wait_seconds));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let mut ticket = self.waiters.register(arn);

            // Re-check after registering so a send that landed between
            // the empty dequeue and the registration is not lost
            match self.cache.receive_message(queue_url, max, visibility).await {
                Ok(messages) if !messages.is_empty() => {
                    self.waiters.cancel(arn, ticket.id);
                    MESSAGES_RECEIVED_TOTAL.inc_by(messages.len() as u64);
                    return Ok(messages);
                }
                Ok(_) => {}
                Err(e) => {
                    self.waiters.cancel(arn, ticket.id);
                    return Err(e);
                }
            }

            tokio::select! {
                _ = &mut ticket.permit => {
                    LongPollMetrics::record_local_wake();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.waiters.cancel(arn, ticket.id);
                    // One final dequeue so a permit consumed by this
                    // waiter in the race with the deadline is not wasted
                    let messages = self
                        .cache
                        .receive_message(queue_url, max, visibility)
                        .await
                        .unwrap_or_default();
                    MESSAGES_RECEIVED_TOTAL.inc_by(messages.len() as u64);
                    return Ok(messages);
                }
                _ = shutdown.recv() => {
                    self.waiters.cancel(arn, ticket.id);
                    tracing::debug!(arn = %arn, "Long poll completed empty at shutdown");
                    return Ok(Vec::new());
                }
            }

            match self.cache.receive_message(queue_url, max, visibility).await {
                Ok(messages) if !messages.is_empty() => {
                    MESSAGES_RECEIVED_TOTAL.inc_by(messages.len() as u64);
                    return Ok(messages);
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            // Woken but beaten to the message; re-register and keep
            // waiting out the remainder of the window
        }
    }

    #[tracing::instrument(name = "service.delete_message", skip(self, receipt_handle), fields(queue = %queue_url))]
    pub async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.registry.get(queue_url)?;
        let handle = parse_handle(receipt_handle)?;
        // Idempotent: deleting an already-deleted message is a no-op
        if self
            .cache
            .delete_message(queue_url, &handle.lookup_key())
            .await?
        {
            MESSAGES_DELETED_TOTAL.inc();
        }
        Ok(())
    }

    #[tracing::instrument(
        name = "service.change_message_visibility",
        skip(self, receipt_handle),
        fields(queue = %queue_url, timeout = visibility_timeout)
    )]
    pub async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<()> {
        self.registry.get(queue_url)?;
        validate_visibility_timeout(visibility_timeout)?;
        let handle = parse_handle(receipt_handle)?;

        let changed = self
            .cache
            .change_message_visibility(queue_url, &handle.lookup_key(), visibility_timeout)
            .await?;
        if !changed {
            return Err(QueueServiceError::ReceiptHandleInvalid(
                receipt_handle.to_string(),
            ));
        }
        if visibility_timeout == 0 {
            // The message is visible again right now; give a waiter a shot
            let queue = self.registry.get(queue_url)?;
            self.notify_arrival(&queue.arn);
        }
        Ok(())
    }

    pub async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteBatchEntry>,
    ) -> Result<BatchResult<String>> {
        self.registry.get(queue_url)?;
        validate_batch(&entries, &self.batch_limits)?;

        let mut result = BatchResult::with_capacity(entries.len());
        for entry in entries {
            let handle = match parse_handle(&entry.receipt_handle) {
                Ok(handle) => handle,
                Err(_) => {
                    result.failures.push(BatchResultError::sender(
                        &entry.id,
                        "ReceiptHandleInvalid",
                        format!("receipt handle {:?} is malformed", entry.receipt_handle),
                    ));
                    continue;
                }
            };
            match self
                .cache
                .delete_message(queue_url, &handle.lookup_key())
                .await
            {
                Ok(true) => {
                    MESSAGES_DELETED_TOTAL.inc();
                    result.successes.push(entry.id);
                }
                Ok(false) => {
                    result.failures.push(BatchResultError::sender(
                        &entry.id,
                        "ReceiptHandleInvalid",
                        "receipt handle does not name a known message",
                    ));
                }
                Err(e) => {
                    result.failures.push(BatchResultError {
                        id: entry.id,
                        code: "InternalError".to_string(),
                        message: e.to_string(),
                        sender_fault: false,
                    });
                }
            }
        }
        Ok(result)
    }

    pub async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<ChangeVisibilityBatchEntry>,
    ) -> Result<BatchResult<String>> {
        self.registry.get(queue_url)?;
        validate_batch(&entries, &self.batch_limits)?;

        let mut result = BatchResult::with_capacity(entries.len());
        for entry in entries {
            if validate_visibility_timeout(entry.visibility_timeout).is_err() {
                result.failures.push(BatchResultError::sender(
                    &entry.id,
                    "InvalidParameterValue",
                    format!(
                        "visibility timeout exceeds {} seconds",
                        MAX_VISIBILITY_TIMEOUT_SECONDS
                    ),
                ));
                continue;
            }
            let handle = match parse_handle(&entry.receipt_handle) {
                Ok(handle) => handle,
                Err(_) => {
                    result.failures.push(BatchResultError::sender(
                        &entry.id,
                        "ReceiptHandleInvalid",
                        format!("receipt handle {:?} is malformed", entry.receipt_handle),
                    ));
                    continue;
                }
            };
            match self
                .cache
                .change_message_visibility(
                    queue_url,
                    &handle.lookup_key(),
                    entry.visibility_timeout,
                )
                .await
            {
                Ok(true) => result.successes.push(entry.id),
                Ok(false) => {
                    result.failures.push(BatchResultError::sender(
                        &entry.id,
                        "ReceiptHandleInvalid",
                        "receipt handle does not name a hidden message",
                    ));
                }
                Err(e) => {
                    result.failures.push(BatchResultError {
                        id: entry.id,
                        code: "InternalError".to_string(),
                        message: e.to_string(),
                        sender_fault: false,
                    });
                }
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn build_message(
        &self,
        queue: &QueueInfo,
        params: &SendMessageParams,
        delay: u32,
        batch_entry_id: Option<String>,
    ) -> Message {
        // Random shard/partition spreads writes; ordering is only
        // promised within a partition
        let mut rng = rand::rng();
        let shard = rng.random_range(0..queue.shards.max(1));
        let partition = rng.random_range(0..queue.partitions_per_shard.max(1));

        let id = self.ids.next(&queue.url, shard, partition);
        let mut message = Message::new(
            id,
            params.body.clone(),
            params.sender_id.clone(),
            params.message_attributes.clone(),
        );
        message.batch_entry_id = batch_entry_id;
        message.delay_seconds = (delay > 0).then_some(delay);
        message
    }

    /// Wake at most one local waiter, then fan the ARN out to peers in
    /// the background. Peer failures never reach the caller.
    fn notify_arrival(&self, arn: &str) {
        self.waiters.notify_one(arn);
        let notifier = self.notifier.clone();
        let arn = arn.to_string();
        tokio::spawn(async move {
            notifier.notify(&arn).await;
        });
    }
}

fn parse_handle(receipt_handle: &str) -> Result<ReceiptHandle> {
    ReceiptHandle::parse(receipt_handle)
        .map_err(|_| QueueServiceError::ReceiptHandleInvalid(receipt_handle.to_string()))
}

fn validate_name(value: &str, what: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 80
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(QueueServiceError::Validation(format!(
            "{} {:?} must match [A-Za-z0-9_-]{{1,80}}",
            what, value
        )))
    }
}

fn validate_body(body: &str, max_bytes: usize) -> Result<()> {
    if body.is_empty() {
        return Err(QueueServiceError::Validation(
            "message body must not be empty".to_string(),
        ));
    }
    if body.len() > max_bytes {
        return Err(QueueServiceError::Validation(format!(
            "message body exceeds {} bytes",
            max_bytes
        )));
    }
    Ok(())
}

fn validate_visibility_timeout(value: u32) -> Result<()> {
    if value > MAX_VISIBILITY_TIMEOUT_SECONDS {
        return Err(QueueServiceError::Validation(format!(
            "visibility timeout must be 0..={}",
            MAX_VISIBILITY_TIMEOUT_SECONDS
        )));
    }
    Ok(())
}

fn validate_delay(value: u32) -> Result<()> {
    if value > MAX_DELAY_SECONDS {
        return Err(QueueServiceError::Validation(format!(
            "delay must be 0..={}",
            MAX_DELAY_SECONDS
        )));
    }
    Ok(())
}
