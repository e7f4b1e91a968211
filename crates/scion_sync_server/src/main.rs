use std::sync::Arc;

use scion_core::VaultPaths;
use scion_sync_server::sync::HEARTBEAT_INTERVAL_SECS;
use scion_sync_server::{app, AppState, Config};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the configured threshold
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "scion_sync_server={0},scion_core={0},tower_http=info",
                    config.log_level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Scion Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Vault path: {:?}", config.vault_path);

    if let Err(e) = std::fs::create_dir_all(&config.vault_path) {
        error!("Failed to create vault root {:?}: {e}", config.vault_path);
        std::process::exit(1);
    }

    let state = AppState::new(VaultPaths::new(config.vault_path.clone()));

    // Heartbeat: ping live channels, evict stale ones
    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            interval.tick().await;
            hub.sweep().await;
        }
    });

    let router = app(state);

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{addr}");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            error!("failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
