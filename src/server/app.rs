use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::AppState;

pub fn create_app(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/queues",
            post(handlers::create_queue).get(handlers::list_queues),
        )
        .route(
            "/queues/{owner}/{name}",
            get(handlers::get_queue).delete(handlers::delete_queue),
        )
        .route(
            "/queues/{owner}/{name}/attributes",
            put(handlers::set_queue_attributes),
        )
        .route(
            "/queues/{owner}/{name}/messages",
            post(handlers::send_message),
        )
        .route(
            "/queues/{owner}/{name}/messages/batch",
            post(handlers::send_message_batch),
        )
        .route(
            "/queues/{owner}/{name}/messages/receive",
            post(handlers::receive_message),
        )
        .route(
            "/queues/{owner}/{name}/messages/delete",
            post(handlers::delete_message),
        )
        .route(
            "/queues/{owner}/{name}/messages/delete-batch",
            post(handlers::delete_message_batch),
        )
        .route(
            "/queues/{owner}/{name}/visibility",
            post(handlers::change_visibility),
        )
        .route(
            "/queues/{owner}/{name}/visibility/batch",
            post(handlers::change_visibility_batch),
        )
        .route("/queues/{owner}/{name}/purge", post(handlers::purge_queue))
        .route("/queues/{owner}/{name}/peek", get(handlers::peek_queue))
        .route("/queues/{owner}/{name}/head", get(handlers::head_ids))
        .route("/queues/{owner}/{name}/count", get(handlers::queue_count))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
