//! REST API routes
//!
//! - `GET /health` - liveness probe
//! - `GET /api/scopes` - status of every scope
//! - `GET /api/scopes/{name}` - status of one scope
//! - `POST /api/scopes/{name}/sync` - queue a forced sync
//! - `POST /api/scopes/{name}/approve` - approve the blocked desired set
//! - `POST /api/scopes/{name}/cancel` - cancel the in-flight sync

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub mod health;
pub mod scopes;

/// Create the API router.
pub fn create_router() -> Router<AppState> {
    let api_routes = Router::new()
        .route("/scopes", get(scopes::list_scopes))
        .route("/scopes/{name}", get(scopes::get_scope))
        .route("/scopes/{name}/sync", post(scopes::sync_scope))
        .route("/scopes/{name}/approve", post(scopes::approve_scope))
        .route("/scopes/{name}/cancel", post(scopes::cancel_scope));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api_routes)
}
