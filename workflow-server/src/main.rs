//! The workflow engine's HTTP process: webhook/event intake routes plus the
//! background executor, timeout, and supervisor pools (§2, §5, §9 "Process
//! topology").
//!
//! Concrete provider adapters (Meta Cloud, Twilio, ElevenLabs, SMTP) are out
//! of scope (§1); this binary wires the in-memory fakes so the engine is
//! runnable end to end against its own queue and store.

mod dto;
mod routes;
mod signature;
mod state;
mod workers;

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use workflow_core::adapters::memory::{FakeMessagingAdapter, FakeTaskAdapter, FakeVoiceAdapter};
use workflow_core::adapters::{MessagingAdapter, TaskAdapter, VoiceAdapter};
use workflow_core::queue::{JobQueue, StoreBackedQueue};
use workflow_core::store::postgres::PostgresStore;
use workflow_core::store::StateStore;
use workflow_core::{Config, Resumer, Supervisor, TriggerMatcher};

use crate::signature::{EnvTenantSecrets, TenantSecrets};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env()?);
    info!(bind_addr = %config.bind_addr, "starting workflow engine");

    let store: Arc<dyn StateStore> = build_store(&config).await?;
    let queue: Arc<dyn JobQueue> = Arc::new(StoreBackedQueue::new(store.clone()));
    let resumer = Arc::new(Resumer::new(store.clone(), queue.clone()));
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        queue.clone(),
        resumer.clone(),
        config.supervisor.clone(),
        config.retention.clone(),
    ));
    let trigger_matcher = Arc::new(TriggerMatcher::new(store.clone(), queue.clone()));
    let secrets: Arc<dyn TenantSecrets> = Arc::new(EnvTenantSecrets);
    let messaging: Arc<dyn MessagingAdapter> = Arc::new(FakeMessagingAdapter::new());
    let voice: Arc<dyn VoiceAdapter> = Arc::new(FakeVoiceAdapter::new());
    let tasks: Arc<dyn TaskAdapter> = Arc::new(FakeTaskAdapter::new());

    let app_state = AppState { store, queue, resumer, supervisor, trigger_matcher, config: config.clone(), secrets, voice, messaging, tasks };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::new();
    worker_handles.extend(workers::spawn_executor_pool(app_state.clone(), config.pools.executor_concurrency, shutdown_rx.clone()));
    worker_handles.extend(workers::spawn_timeout_pool(app_state.clone(), config.pools.timeout_concurrency, shutdown_rx.clone()));
    worker_handles.push(workers::spawn_supervisor_loop(app_state.clone(), shutdown_rx.clone()));

    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind_addr = %config.bind_addr, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("shutdown signal received, stopping worker pools");
    shutdown_tx.send(true).ok();
    for handle in worker_handles {
        handle.await.ok();
    }
    info!("workflow engine stopped");

    Ok(())
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn StateStore>> {
    info!(database_url = %config.database_url, "connecting to store");
    let pool = sqlx::PgPool::connect(&config.database_url).await?;
    let store = PostgresStore::new(pool);
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
}
