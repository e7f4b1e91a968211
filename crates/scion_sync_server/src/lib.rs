//! Scion Sync Server
//!
//! A self-hosted, multi-vault synchronization server for personal note
//! collections. Each vault is a history-preserving repository with stable
//! per-file identity; clients sync over HTTP (single and batched atomic
//! operations, three-way merge on divergence) and collaborate in real time
//! over per-vault WebSocket channels carrying CRDT updates.
//!
//! ## Environment Variables
//!
//! - `HOST`: bind address (default: 0.0.0.0)
//! - `PORT`: listen port (default: 3030)
//! - `LOG_LEVEL`: logger threshold (default: info)
//! - `VAULT_PATH`: root directory for all vaults (default: ./vaults)

pub mod config;
pub mod handlers;
pub mod registry;
pub mod sync;

use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use scion_core::VaultPaths;

pub use config::Config;
use handlers::api;
use registry::VaultRegistry;
use sync::ChannelHub;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<VaultRegistry>,
    pub hub: Arc<ChannelHub>,
}

impl AppState {
    pub fn new(paths: VaultPaths) -> Self {
        Self {
            registry: Arc::new(VaultRegistry::new(paths)),
            hub: Arc::new(ChannelHub::new()),
        }
    }
}

/// Build the full router, CORS and tracing layers included.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(api::health))
        .route("/ws/status", get(api::ws_status))
        .route("/vault/{vault}/manifest", get(api::get_manifest))
        .route("/vault/{vault}/status", get(api::get_status))
        .route(
            "/vault/{vault}/file/{*path}",
            get(api::get_file).delete(api::delete_file),
        )
        .route("/vault/{vault}/file-by-id/{file_id}", get(api::get_file_by_id))
        .route("/vault/{vault}/history/{*path}", get(api::get_history))
        .route("/vault/{vault}/sync", post(api::post_sync))
        .route("/vault/{vault}/sync/v2", post(api::post_sync_v2))
        .route("/vault/{vault}/detect-rename", post(api::post_detect_rename))
        .route("/vault/{vault}/rename", post(api::post_rename))
        .route("/vault/{vault}/ws", get(handlers::ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
