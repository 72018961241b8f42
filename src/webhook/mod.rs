//! HTTP webhook transport.
//!
//! The orchestrator can deliver the same control messages as HTTP POSTs
//! instead of over the WebSocket. Each request carries one envelope and the
//! immediate reply (if any) comes back as the response body.

mod routes;

use std::net::SocketAddr;

use anyhow::Context;
use axum::{extract::DefaultBodyLimit, http::StatusCode, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::link_proto::wire::MAX_FRAME_SIZE;

/// Build the webhook router.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .merge(routes::webhook_routes())
        .fallback(fallback)
        .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Serve the webhook on `bind` until `shutdown` is cancelled.
pub async fn serve(bind: SocketAddr, dispatcher: Dispatcher, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "webhook listening");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("webhook server failed")?;

    info!("webhook stopped");
    Ok(())
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
