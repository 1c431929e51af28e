//! Health check endpoint: GET /health

/// GET /health - liveness probe
pub async fn health_check() -> &'static str {
    "OK"
}
