use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use helix_mq::cache::{create_message_cache, CacheLayer};
use helix_mq::config::Settings;
use helix_mq::longpoll::{
    create_peer_directory, NotificationListener, PeerSet, TcpPeerNotifier, WaitRegistry,
};
use helix_mq::message::IdGenerator;
use helix_mq::queue::QueueRegistry;
use helix_mq::redis::pool::RedisPool;
use helix_mq::redis::{CircuitBreaker, CircuitBreakerConfig, RedisHealth};
use helix_mq::server::{create_app, AppState};
use helix_mq::service::QueueService;
use helix_mq::shutdown::GracefulShutdown;
use helix_mq::store::MemoryDurableStore;
use helix_mq::tasks::{ConsistencyCheckTask, HeartbeatTask, VisibilitySweeper};
use helix_mq::visibility::VisibilityTracker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Arc::new(Settings::new()?);
    tracing::info!("Configuration loaded");

    // One broadcast channel coordinates every background task and
    // pending long-poll at shutdown
    let (shutdown_tx, _) = broadcast::channel(8);

    // Redis pool, shared by the cache backend and peer directory when
    // either is configured to use it
    let redis_pool = build_redis_pool(&settings);

    // Core state
    let store = Arc::new(MemoryDurableStore::new());
    let tracker = Arc::new(VisibilityTracker::new());
    let cache_backend = create_message_cache(&settings.cache, redis_pool.clone());
    let cache = Arc::new(CacheLayer::new(
        store,
        cache_backend,
        tracker,
        settings.cache.fill_page_size,
    ));
    let registry = Arc::new(QueueRegistry::new());
    let waiters = Arc::new(WaitRegistry::new());

    // Cross-process notification listener; bind before the heartbeat so
    // the advertised port is the bound one
    let notification_listener = NotificationListener::bind(
        &settings.listener_addr(),
        waiters.clone(),
        shutdown_tx.subscribe(),
    )
    .await?;
    let listener_port = notification_listener.local_addr()?.port();
    let listener_handle = tokio::spawn(notification_listener.run());

    // Peer discovery + outbound notifier
    let peers = Arc::new(PeerSet::new());
    let directory = create_peer_directory(&settings.longpoll, redis_pool.clone());
    let notifier = Arc::new(TcpPeerNotifier::new(
        peers.clone(),
        Duration::from_millis(settings.longpoll.notify_connect_timeout_ms),
    ));

    let service = Arc::new(QueueService::new(
        registry.clone(),
        cache.clone(),
        waiters.clone(),
        notifier,
        Arc::new(IdGenerator::new(settings.node.node_id.clone())),
        settings.queue_defaults.clone(),
        settings.batch.clone(),
        settings.longpoll.clone(),
        settings.node.datacenter.clone(),
        shutdown_tx.clone(),
    ));
    tracing::info!("Queue service initialized");

    // Background tasks
    let sweeper_handle = tokio::spawn(
        VisibilitySweeper::new(
            settings.sweeper.interval_ms,
            registry.clone(),
            cache.clone(),
            waiters.clone(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );
    let heartbeat_handle = tokio::spawn(
        HeartbeatTask::new(
            settings.longpoll.clone(),
            settings.node.clone(),
            listener_port,
            directory,
            peers,
            shutdown_tx.subscribe(),
        )
        .run(),
    );
    let consistency_handle = tokio::spawn(
        ConsistencyCheckTask::new(
            settings.cache.consistency_check_interval_seconds,
            registry.clone(),
            cache.clone(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    // HTTP server
    let app = create_app(AppState::new(settings.clone(), service));
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Complete pending long-polls and stop background tasks
    GracefulShutdown::new(waiters, shutdown_tx)
        .execute("process exit")
        .await;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(
        listener_handle,
        sweeper_handle,
        heartbeat_handle,
        consistency_handle
    );

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn build_redis_pool(settings: &Settings) -> Option<Arc<RedisPool>> {
    let wanted = settings.cache.backend == "redis" || settings.longpoll.directory == "redis";
    if !wanted {
        return None;
    }

    let circuit_breaker = Arc::new(CircuitBreaker::with_config(
        CircuitBreakerConfig::from_settings(&settings.redis),
    ));
    let health = Arc::new(RedisHealth::new());
    match RedisPool::new(settings.redis.clone(), circuit_breaker, health) {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            tracing::warn!(error = %e, "Redis pool unavailable, falling back to memory backends");
            None
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
