use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tinyobs::cancel::CancelToken;
use tinyobs::cardinality::CardinalityTracker;
use tinyobs::ingest::Ingestor;
use tinyobs::lifecycle::{spawn_broadcaster, Broadcaster, Supervisor};
use tinyobs::query::Executor;
use tinyobs::storage::lsm::LsmEngine;
use tinyobs::storage::StorageEngine;
use tinyobs::storage_monitor::StorageMonitor;
use tinyobs::{config::TinyObsConfig, handlers, AppState};

const SHUTDOWN_HTTP_GRACE: Duration = Duration::from_secs(30);
const SHUTDOWN_WORKER_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tinyobs=info,tower_http=info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config_path = std::env::var("TINYOBS_CONFIG").unwrap_or_else(|_| "tinyobs.toml".to_string());
    let config = Arc::new(TinyObsConfig::load(&config_path)?);

    let storage: Arc<dyn StorageEngine> = Arc::new(LsmEngine::open(&config.storage)?);
    let cardinality = Arc::new(CardinalityTracker::new(config.cardinality.clone()));
    let storage_monitor = Arc::new(StorageMonitor::new(
        config.storage.data_dir.clone(),
        config.storage.max_storage_bytes,
    ));
    let executor = Arc::new(Executor::new(storage.clone(), config.query.max_samples));
    let ingestor = Arc::new(Ingestor::new(
        storage.clone(),
        cardinality.clone(),
        Some(storage_monitor.clone()),
        config.ingest.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new());

    let shutdown_signal = CancelToken::new();
    let supervisor = Supervisor::spawn(storage.clone(), config.compaction.clone(), shutdown_signal.clone());
    let broadcaster_handle = spawn_broadcaster(storage.clone(), broadcaster.clone(), shutdown_signal.clone());

    let state = AppState {
        storage: storage.clone(),
        cardinality,
        storage_monitor,
        compaction_monitor: supervisor.compaction_monitor.clone(),
        executor,
        ingestor,
        broadcaster,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/v1/ingest", post(handlers::ingest::ingest))
        .route("/v1/query", get(handlers::query::range_query))
        .route("/v1/query/execute", post(handlers::query::execute_query))
        .route("/v1/query/instant", get(handlers::query::instant_query))
        .route("/v1/stats", get(handlers::stats::get_stats))
        .route("/v1/cardinality", get(handlers::stats::get_cardinality))
        .route("/v1/storage", get(handlers::stats::get_storage))
        .route("/v1/health", get(handlers::health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port()).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tinyobs listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_future())
        .await?;

    // Shutdown sequence: cancel the shared signal first so
    // background loops stop making new progress, then bound how long we
    // wait on them, and only close storage once nothing else can touch it.
    shutdown_signal.cancel();
    supervisor.cancel_all();
    tokio::time::timeout(SHUTDOWN_WORKER_TIMEOUT, async {
        let _ = broadcaster_handle.await;
    })
    .await
    .ok();
    supervisor.wait(SHUTDOWN_WORKER_TIMEOUT).await;
    storage.close().await?;

    Ok(())
}

/// Resolves once either Ctrl-C or SIGTERM arrives, giving callers up to
/// [`SHUTDOWN_HTTP_GRACE`] of in-flight request time before the listener
/// actually stops accepting new connections.
async fn shutdown_future() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining for up to {SHUTDOWN_HTTP_GRACE:?}");
}
