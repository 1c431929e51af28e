//! Scope endpoints under /api/scopes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use keel_reconciler::ScopeStatus;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::error::Result;

/// Reply to a queued sync.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub scope: String,
    pub message: String,
}

/// Reply to an approval.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApproveResponse {
    pub scope: String,
    pub fingerprint: String,
}

/// Reply to a cancel request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub scope: String,
    /// Whether a sync was in flight.
    pub cancelled: bool,
}

/// GET /api/scopes
pub async fn list_scopes(State(state): State<AppState>) -> Json<Vec<ScopeStatus>> {
    Json(state.registry.statuses())
}

/// GET /api/scopes/{name}
pub async fn get_scope(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<ScopeStatus>> {
    Ok(Json(state.registry.get(&name)?.status()))
}

/// POST /api/scopes/{name}/sync
pub async fn sync_scope(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<SyncResponse>)> {
    state.registry.get(&name)?.request_sync().await?;
    info!(scope = %name, "Sync requested over HTTP");
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncResponse {
            scope: name,
            message: "sync queued".to_string(),
        }),
    ))
}

/// POST /api/scopes/{name}/approve
///
/// Replies once the approval is recorded; the sync runs in the background.
pub async fn approve_scope(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<ApproveResponse>)> {
    let fingerprint = state.registry.get(&name)?.approve().await?;
    info!(scope = %name, "Approval recorded over HTTP");
    Ok((StatusCode::ACCEPTED, Json(ApproveResponse { scope: name, fingerprint })))
}

/// POST /api/scopes/{name}/cancel
pub async fn cancel_scope(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<CancelResponse>> {
    let cancelled = state.registry.get(&name)?.cancel()?;
    Ok(Json(CancelResponse { scope: name, cancelled }))
}
