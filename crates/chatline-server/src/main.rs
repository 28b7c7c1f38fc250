mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use chatline_api::{AppState, AppStateInner};
use chatline_db::{Database, Store};
use chatline_gateway::MemoryBroker;

use crate::config::Config;

/// How often expired room caches are dropped.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Time given to queued side effects after the listener stops.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatline=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let addr = config.addr()?;

    // Init database
    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    let store = Store::new(Arc::new(db), config.store_timeout);

    let state = AppStateInner::compose(store, Arc::new(MemoryBroker::default()), config.core());
    info!("node {} starting", state.node_id);

    tokio::spawn(state.reconciler.clone().run(state.shutdown.clone()));
    tokio::spawn(sweep_caches(state.clone(), state.shutdown.clone()));

    let app = chatline_api::router(state.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Chatline server listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    // upgraded sockets are not tracked by serve and end with the runtime
    // stop consumers, then let workers drain
    state.bridge.shutdown();
    state.pipeline.shutdown(DRAIN_GRACE).await;
    info!("Chatline server stopped");
    Ok(())
}

async fn sweep_caches(state: AppState, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(CACHE_SWEEP_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let dropped = state.cache.purge_expired();
        if dropped > 0 {
            debug!("cache sweep: dropped {} expired rooms", dropped);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
