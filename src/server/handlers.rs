//! HTTP handlers over the queue service.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;

use crate::error::Result;
use crate::queue::{QueueAttributeUpdate, QueueInfo};
use crate::service::{
    ChangeVisibilityBatchEntry, DeleteBatchEntry, ReceiveMessageParams, SendBatchEntry,
    SendMessageParams,
};

use super::models::{
    ChangeVisibilityBatchRequest, ChangeVisibilityRequest, CreateQueueRequest,
    DeleteMessageBatchRequest, DeleteMessageRequest, HeadIdsResponse, HeadQuery, HealthResponse,
    MessageView, PeekQuery, PeekResponse, PurgeQueueResponse, QueueCountResponse,
    ReceiveMessageRequest, ReceiveMessageResponse, SendMessageBatchRequest, SendMessageRequest,
    SendMessageResponse,
};
use super::AppState;

fn queue_url(owner: &str, name: &str) -> String {
    format!("/{}/{}", owner, name)
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::encode_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response()
        }
    }
}

#[tracing::instrument(name = "http.create_queue", skip(state, request), fields(name = %request.name))]
pub async fn create_queue(
    State(state): State<AppState>,
    Json(request): Json<CreateQueueRequest>,
) -> Result<Json<QueueInfo>> {
    let info = state
        .service
        .create_queue(&request.owner, &request.name, request.attributes)?;
    Ok(Json((*info).clone()))
}

pub async fn list_queues(State(state): State<AppState>) -> Json<Vec<QueueInfo>> {
    let queues = state
        .service
        .list_queues()
        .into_iter()
        .map(|q| (*q).clone())
        .collect();
    Json(queues)
}

pub async fn get_queue(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<QueueInfo>> {
    let info = state.service.get_queue(&queue_url(&owner, &name))?;
    Ok(Json((*info).clone()))
}

#[tracing::instrument(name = "http.set_queue_attributes", skip(state, update))]
pub async fn set_queue_attributes(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(update): Json<QueueAttributeUpdate>,
) -> Result<Json<QueueInfo>> {
    let info = state
        .service
        .set_queue_attributes(&queue_url(&owner, &name), &update)?;
    Ok(Json((*info).clone()))
}

#[tracing::instrument(name = "http.delete_queue", skip(state))]
pub async fn delete_queue(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.service.delete_queue(&queue_url(&owner, &name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(name = "http.send_message", skip(state, request))]
pub async fn send_message(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>> {
    let result = state
        .service
        .send_message(
            &queue_url(&owner, &name),
            SendMessageParams {
                body: request.body,
                delay_seconds: request.delay_seconds,
                message_attributes: request.message_attributes,
                sender_id: None,
            },
        )
        .await?;

    Ok(Json(SendMessageResponse {
        message_id: result.message_id.to_string(),
        md5_of_body: result.md5_of_body,
        timestamp: Utc::now(),
    }))
}

#[tracing::instrument(
    name = "http.send_message_batch",
    skip(state, request),
    fields(entries = request.entries.len())
)]
pub async fn send_message_batch(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<SendMessageBatchRequest>,
) -> Result<impl IntoResponse> {
    let entries = request
        .entries
        .into_iter()
        .map(|e| SendBatchEntry {
            id: e.id,
            body: e.body,
            delay_seconds: e.delay_seconds,
            message_attributes: e.message_attributes,
        })
        .collect();

    let result = state
        .service
        .send_message_batch(&queue_url(&owner, &name), entries)
        .await?;
    Ok(Json(result))
}

#[tracing::instrument(name = "http.receive_message", skip(state, request))]
pub async fn receive_message(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<ReceiveMessageRequest>,
) -> Result<Json<ReceiveMessageResponse>> {
    let messages = state
        .service
        .receive_message(
            &queue_url(&owner, &name),
            ReceiveMessageParams {
                max_messages: request.max_number_of_messages.unwrap_or(1),
                visibility_timeout: request.visibility_timeout,
                wait_time_seconds: request.wait_time_seconds,
            },
        )
        .await?;

    Ok(Json(ReceiveMessageResponse {
        messages: messages.into_iter().map(MessageView::from).collect(),
    }))
}

#[tracing::instrument(name = "http.delete_message", skip(state, request))]
pub async fn delete_message(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<DeleteMessageRequest>,
) -> Result<StatusCode> {
    state
        .service
        .delete_message(&queue_url(&owner, &name), &request.receipt_handle)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(
    name = "http.delete_message_batch",
    skip(state, request),
    fields(entries = request.entries.len())
)]
pub async fn delete_message_batch(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<DeleteMessageBatchRequest>,
) -> Result<impl IntoResponse> {
    let entries = request
        .entries
        .into_iter()
        .map(|e| DeleteBatchEntry {
            id: e.id,
            receipt_handle: e.receipt_handle,
        })
        .collect();

    let result = state
        .service
        .delete_message_batch(&queue_url(&owner, &name), entries)
        .await?;
    Ok(Json(result))
}

#[tracing::instrument(name = "http.change_visibility", skip(state, request))]
pub async fn change_visibility(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<ChangeVisibilityRequest>,
) -> Result<StatusCode> {
    state
        .service
        .change_message_visibility(
            &queue_url(&owner, &name),
            &request.receipt_handle,
            request.visibility_timeout,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(
    name = "http.change_visibility_batch",
    skip(state, request),
    fields(entries = request.entries.len())
)]
pub async fn change_visibility_batch(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<ChangeVisibilityBatchRequest>,
) -> Result<impl IntoResponse> {
    let entries = request
        .entries
        .into_iter()
        .map(|e| ChangeVisibilityBatchEntry {
            id: e.id,
            receipt_handle: e.receipt_handle,
            visibility_timeout: e.visibility_timeout,
        })
        .collect();

    let result = state
        .service
        .change_message_visibility_batch(&queue_url(&owner, &name), entries)
        .await?;
    Ok(Json(result))
}

#[tracing::instrument(name = "http.purge_queue", skip(state))]
pub async fn purge_queue(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<PurgeQueueResponse>> {
    let purged = state.service.purge_queue(&queue_url(&owner, &name)).await?;
    Ok(Json(PurgeQueueResponse { purged }))
}

pub async fn peek_queue(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<PeekQuery>,
) -> Result<Json<PeekResponse>> {
    let messages = state
        .service
        .peek_queue(
            &queue_url(&owner, &name),
            query.cursor.as_deref(),
            query.limit.unwrap_or(100),
        )
        .await?;

    let next_cursor = messages.last().map(|m| m.id.to_string());
    Ok(Json(PeekResponse {
        messages: messages.into_iter().map(MessageView::from).collect(),
        next_cursor,
    }))
}

pub async fn head_ids(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<HeadQuery>,
) -> Result<Json<HeadIdsResponse>> {
    let ids = state
        .service
        .ids_from_head(&queue_url(&owner, &name), query.limit.unwrap_or(10).clamp(1, 100))
        .await?;
    Ok(Json(HeadIdsResponse { ids }))
}

pub async fn queue_count(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<QueueCountResponse>> {
    let count = state
        .service
        .queue_message_count(&queue_url(&owner, &name))
        .await?;
    Ok(Json(QueueCountResponse {
        approximate_number_of_messages: count,
    }))
}
