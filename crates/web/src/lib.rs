//! Keel operational HTTP API.
//!
//! Exposes per-scope status and the operator actions (force sync, approve,
//! cancel) over a small axum router with request tracing.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use std::future::Future;

use axum::Router;
use keel_reconciler::ScopeRegistry;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
pub mod routes;

pub use error::{AppError, ErrorResponse};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Running scopes.
    pub registry: ScopeRegistry,
}

impl AppState {
    pub const fn new(registry: ScopeRegistry) -> Self {
        Self { registry }
    }
}

/// Create the application router with middleware.
pub fn create_app(state: AppState) -> Router {
    routes::create_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Keel API listening");
    }
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown)
        .await
}
