//! Thin HTTP framing over [`vpnctl_controller::Controller`]: the three
//! provider webhook endpoints and the two admin endpoints. All business
//! logic lives in `vpnctl-controller`/`vpnctl-store`; this crate only
//! extracts requests, dispatches, and picks a status code.

mod admin;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use vpnctl_controller::Controller;
use vpnctl_store::Store;
use vpnctl_wireguard::Gateway;

/// Shared state every handler closes over.
pub struct WebhookState {
    pub controller: Arc<Controller>,
    pub store: Arc<Store>,
    pub gateway: Gateway,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::router())
        .merge(admin::router())
        .layer(cors)
        .with_state(state)
}

/// Binds `addr` and serves the webhook/admin router until the process
/// exits. Callers (the node binary) run this inside `tokio::spawn`.
pub async fn serve(state: Arc<WebhookState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webhook server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
