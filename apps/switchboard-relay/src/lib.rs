//! Reference relay: assigns nothing, remembers nothing, and forwards envelopes between the
//! identities currently connected.

pub mod cli;
pub mod config;
mod websocket;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use websocket::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn health_check() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "switchboard::relay", error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "switchboard::relay", "shutting down");
}
