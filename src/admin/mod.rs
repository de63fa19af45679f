//! Read-only admin API over the published configurations.
//!
//! - `GET /api/version`
//! - `GET /api/rawdata`
//! - `GET /api/providers/{name}`

pub mod auth;
pub mod handlers;
pub mod store;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;

pub use store::ConfigStore;

#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<ConfigStore>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(store: Arc<ConfigStore>, api_key: &str) -> Self {
        Self {
            store,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/version", get(get_version))
        .route("/api/rawdata", get(get_rawdata))
        .route("/api/providers/{name}", get(get_provider))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
