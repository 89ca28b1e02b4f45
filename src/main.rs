//! Storefront Sync - engine host with a local diagnostics surface
//!
//! Starts the sync engine against the configured storefront API and realtime
//! endpoint, then serves diagnostics over HTTP until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_sync::session::SessionStore;
use storefront_sync::{create_router, spawn_maintenance_task, AppState, Config, SyncEngine};

/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Begin the session (client id and markers)
/// 4. Build and start the sync engine
/// 5. Start the background maintenance task
/// 6. Serve the diagnostics router
/// 7. On SIGINT/SIGTERM stop the server, the engine and the task
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront_sync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting storefront sync engine");

    let config = Config::from_env();
    info!(
        "Configuration loaded: api={}, ws={}, max_entries={}, stale={}ms, diagnostics_port={}",
        config.api_base_url,
        config.ws_endpoint,
        config.max_entries,
        config.default_stale_ms,
        config.diagnostics_port
    );

    let session = SessionStore::from_config(&config)
        .begin()
        .await
        .context("failed to start session")?;

    let maintenance_interval = config.maintenance_interval;
    let port = config.diagnostics_port;
    let engine = SyncEngine::builder(config)
        .client_id(session.client_id.to_string())
        .build()
        .context("failed to build sync engine")?;
    let engine = Arc::new(engine);
    engine.start();

    let maintenance = spawn_maintenance_task(engine.clone(), maintenance_interval);
    info!("Background maintenance task started");

    let app = create_router(AppState::new(engine.clone()));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Diagnostics listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("diagnostics server failed")?;

    maintenance.abort();
    warn!("Maintenance task aborted");
    engine.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
