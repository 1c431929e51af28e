//! REST API integration tests

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use keel_core::ControllerConfig;
use keel_reconciler::{Controller, InMemoryCluster, ScopeRegistry, SyncStatus};
use keel_source::{InMemoryBackend, PathFilter, RetryPolicy, SourceTracker};
use keel_web::{create_app, AppState};
use serde_json::Value;
use tower::ServiceExt;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const CONFIG: &str = r#"
[[scopes]]
name = "shop"
environment = "production"
[scopes.source]
location = "."
poll_interval_secs = 3600

[[scopes]]
name = "gated"
environment = "production"
[scopes.source]
location = "."
poll_interval_secs = 3600
[scopes.policy]
manual_approval_required = true
"#;

fn repo() -> BTreeMap<String, String> {
    [
        (
            "base/web.yaml",
            "kind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3\n",
        ),
        (
            "overlays/production/overlay.yaml",
            "kind: Overlay\nenvironment: production\nbase: ../../base\nnamespace: shop\n",
        ),
    ]
    .into_iter()
    .map(|(path, contents)| (path.to_string(), contents.to_string()))
    .collect()
}

fn start() -> Result<Controller, Box<dyn std::error::Error>> {
    let config = ControllerConfig::from_toml_str(CONFIG)?;
    let mut scopes = Vec::new();
    for scope in config.scopes {
        let tracker = SourceTracker::new(
            Arc::new(InMemoryBackend::new(repo())),
            "main",
            PathFilter::yaml(".")?,
            RetryPolicy::new(1, 1, 1),
        );
        scopes.push((scope, tracker, Arc::new(InMemoryCluster::new()) as Arc<dyn keel_reconciler::ClusterApi>));
    }
    Ok(Controller::start_with(scopes))
}

async fn settle(registry: &ScopeRegistry) -> TestResult {
    let mut shop = registry.get("shop")?.subscribe();
    let mut gated = registry.get("gated")?.subscribe();
    tokio::time::timeout(Duration::from_secs(5), shop.wait_for(|s| s.status == SyncStatus::Synced)).await??;
    tokio::time::timeout(Duration::from_secs(5), gated.wait_for(|s| s.pending_approval.is_some())).await??;
    Ok(())
}

async fn send(app: &Router, method: Method, uri: &str) -> Result<(StatusCode, Vec<u8>), Box<dyn std::error::Error>> {
    let request = Request::builder().method(method).uri(uri).body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes().to_vec();
    Ok((status, body))
}

async fn send_json(app: &Router, method: Method, uri: &str) -> Result<(StatusCode, Value), Box<dyn std::error::Error>> {
    let (status, body) = send(app, method, uri).await?;
    Ok((status, serde_json::from_slice(&body)?))
}

#[tokio::test]
async fn test_health_returns_ok() -> TestResult {
    let controller = start()?;
    let app = create_app(AppState::new(controller.registry()));

    let (status, body) = send(&app, Method::GET, "/health").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
    controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_scope_status_endpoints() -> TestResult {
    // Given: two running scopes that finished their first cycle
    let controller = start()?;
    let registry = controller.registry();
    settle(&registry).await?;
    let app = create_app(AppState::new(registry));

    // When: listing and fetching scopes
    let (list_status, list) = send_json(&app, Method::GET, "/api/scopes").await?;
    let (one_status, one) = send_json(&app, Method::GET, "/api/scopes/shop").await?;

    // Then: statuses are reported by name
    assert_eq!(list_status, StatusCode::OK);
    let names: Vec<&str> = list
        .as_array()
        .ok_or("expected an array")?
        .iter()
        .filter_map(|s| s["scope"].as_str())
        .collect();
    assert_eq!(names, vec!["gated", "shop"]);
    assert_eq!(one_status, StatusCode::OK);
    assert_eq!(one["status"], "synced");
    assert_eq!(one["object_count"], 1);
    controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_scope_is_problem_details_404() -> TestResult {
    let controller = start()?;
    let app = create_app(AppState::new(controller.registry()));

    let (status, body) = send_json(&app, Method::GET, "/api/scopes/missing").await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
    assert_eq!(body["title"], "Not Found");
    assert!(body["detail"].as_str().is_some_and(|d| d.contains("missing")));
    controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_operator_actions() -> TestResult {
    // Given: one synced scope and one blocked on approval
    let controller = start()?;
    let registry = controller.registry();
    settle(&registry).await?;
    let app = create_app(AppState::new(registry.clone()));

    // When/Then: nothing to cancel or approve on the synced scope
    let (status, body) = send_json(&app, Method::POST, "/api/scopes/shop/cancel").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);

    let (status, body) = send_json(&app, Method::POST, "/api/scopes/shop/approve").await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], 409);

    // When/Then: a forced sync is queued
    let (status, body) = send_json(&app, Method::POST, "/api/scopes/shop/sync").await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["scope"], "shop");

    // When: the blocked scope is approved
    let pending = registry.get("gated")?.status().pending_approval.ok_or("nothing pending")?;
    let (status, body) = send_json(&app, Method::POST, "/api/scopes/gated/approve").await?;

    // Then: the approval is accepted with its fingerprint and the scope converges afterwards
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["fingerprint"], pending.as_str());
    let mut gated = registry.get("gated")?.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        gated.wait_for(|s| s.status == SyncStatus::Synced && s.pending_approval.is_none()),
    )
    .await??;

    controller.shutdown().await;
    Ok(())
}
