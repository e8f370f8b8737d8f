mod api;
mod config;
mod db;
mod engines;
mod events;
mod filetree;
mod gateway;
mod models;
mod monitor;
mod offload;
mod providers;
mod rclone;
mod rpc;
mod search;
mod service;
mod state;
mod torrent;

#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::db::TaskDb;
use crate::events::EventBus;
use crate::monitor::{Monitor, STARTUP_WAIT};
use crate::providers::ProviderRegistry;
use crate::rclone::RcloneClient;
use crate::rpc::Aria2Client;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::load());
    std::fs::create_dir_all(config.data_dir())
        .with_context(|| format!("failed to create data dir {}", config.data_dir().display()))?;

    let db = TaskDb::new(&config.database_path()).await?;
    let aria2 = Arc::new(Aria2Client::with_timeout(
        config.aria2_rpc_url.clone(),
        config.aria2_secret.clone(),
        Duration::from_secs(config.request_timeout_secs.max(1)),
    ));
    let rclone = RcloneClient::new(config.rclone_rc_url.clone());
    let state = Arc::new(AppState::assemble(
        config.clone(),
        db,
        aria2,
        rclone,
        Arc::new(ProviderRegistry::with_defaults()),
        EventBus::new(4096),
    ));

    if let Err(err) = state.service.load_providers().await {
        warn!("failed to load provider configs: {err}");
    }
    let settings = state.service.settings().await?;
    if state.engines.enabled() {
        state
            .engines
            .start_all(settings.aria2_options())
            .await
            .context("failed to start engines")?;
    }

    let monitor = Monitor::new(
        state.aria2.clone(),
        state.rclone.clone(),
        state.db.clone(),
        state.events.clone(),
        state.offloader.clone(),
        Duration::from_secs(config.poll_interval_secs.max(1)),
        Duration::from_millis(config.publish_interval_ms.max(100)),
    );
    if monitor.wait_for_aria2(STARTUP_WAIT).await {
        if let Err(err) = monitor.startup_sync().await {
            warn!("startup sync failed: {err:#}");
        }
        state.service.apply_settings(&settings).await;
    } else {
        warn!("aria2 not reachable at {}; continuing without startup sync", config.aria2_rpc_url);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = monitor.spawn(shutdown_rx.clone());
    workers.push(state.search.spawn(shutdown_rx));

    let app = match state.config.static_dir() {
        Some(dir) if dir.exists() => {
            info!("serving dashboard from {}", dir.display());
            api::router(state.clone()).fallback_service(ServeDir::new(dir))
        }
        Some(dir) => {
            warn!("static dir {} missing; dashboard will not be served", dir.display());
            api::router(state.clone())
        }
        None => api::router(state.clone()),
    };

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("gravity listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(err) = worker.await {
            warn!("background task ended abnormally: {err}");
        }
    }
    monitor.final_sync().await;
    state.engines.stop_all().await;
    state.aria2.close().await;
    info!("gravity stopped");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
