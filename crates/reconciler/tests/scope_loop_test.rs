//! Behavioural tests for a scope driven end to end: source, compile, observe,
//! diff, sync and drift against an in-memory environment.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    fields, ControllerConfig, Error, HealthCheck, HealthCondition, ObjectKey, ScopeConfig, TRACKING_LABEL,
};
use keel_reconciler::{
    ClusterOp, Controller, HealthState, InMemoryCluster, JournalEntry, ScopeLoop, SyncPhase, SyncStatus,
    SyncTrigger,
};
use keel_source::{InMemoryBackend, PathFilter, RetryPolicy, SourceTracker};
use serde_json::json;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const CONFIG: &str = r#"
[[scopes]]
name = "shop"
environment = "production"

[scopes.source]
location = "."
poll_interval_secs = 3600

[scopes.limits]
call_timeout_ms = 1000
health_poll_interval_ms = 5
"#;

fn deployment(name: &str, replicas: u32) -> String {
    format!("kind: Deployment\nmetadata:\n  name: {name}\nspec:\n  replicas: {replicas}\n")
}

fn repo(deployments: &[(&str, u32)]) -> BTreeMap<String, String> {
    let mut files: BTreeMap<String, String> = deployments
        .iter()
        .map(|(name, replicas)| (format!("base/{name}.yaml"), deployment(name, *replicas)))
        .collect();
    files.insert(
        "overlays/production/overlay.yaml".to_string(),
        "kind: Overlay\nenvironment: production\nbase: ../../base\nnamespace: shop\n".to_string(),
    );
    files
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("Deployment", "shop", name)
}

fn scope_config(customize: impl FnOnce(&mut ScopeConfig)) -> Result<ScopeConfig, Error> {
    let mut config = ControllerConfig::from_toml_str(CONFIG)?;
    let mut scope = config.scopes.remove(0);
    customize(&mut scope);
    Ok(scope)
}

struct Fixture {
    backend: Arc<InMemoryBackend>,
    cluster: Arc<InMemoryCluster>,
    scope: ScopeLoop,
}

fn tracker(backend: Arc<InMemoryBackend>) -> Result<SourceTracker, Error> {
    Ok(SourceTracker::new(
        backend,
        "main",
        PathFilter::yaml(".")?,
        RetryPolicy::new(2, 1, 2).with_jitter(0.0),
    ))
}

fn fixture(files: BTreeMap<String, String>, customize: impl FnOnce(&mut ScopeConfig)) -> Result<Fixture, Error> {
    let backend = Arc::new(InMemoryBackend::new(files));
    let cluster = Arc::new(InMemoryCluster::new());
    let config = scope_config(customize)?;
    let (scope, _handle) = ScopeLoop::new(&config, tracker(backend.clone())?, cluster.clone());
    Ok(Fixture { backend, cluster, scope })
}

async fn replicas(cluster: &InMemoryCluster, name: &str) -> Option<serde_json::Value> {
    let attributes = cluster.object(&key(name)).await?;
    fields::get(&attributes, "spec.replicas").cloned()
}

#[tokio::test]
async fn test_new_revision_is_compiled_and_applied_once() -> TestResult {
    // Given: a repository declaring one Deployment
    let mut f = fixture(repo(&[("web", 3)]), |_| {})?;

    // When: the source is polled twice
    let first = f.scope.poll_source().await?;
    let second = f.scope.poll_source().await?;

    // Then: the object is created once, labelled, and the scope is synced
    assert_eq!(first.map(|r| r.status), Some(SyncStatus::Synced));
    assert!(second.is_none());
    assert_eq!(
        f.cluster.journal(),
        vec![JournalEntry {
            op: ClusterOp::Create,
            key: key("web"),
        }]
    );
    let live = f.cluster.object(&key("web")).await.ok_or("web missing")?;
    let labels = live.get("metadata").and_then(|m| m.get("labels")).ok_or("no labels")?;
    assert_eq!(labels.get(TRACKING_LABEL), Some(&json!("shop")));
    let status = f.scope.status();
    assert_eq!(status.status, SyncStatus::Synced);
    assert_eq!(status.object_count, 1);
    assert!(status.revision.is_some());
    Ok(())
}

#[tokio::test]
async fn test_second_pass_without_drift_changes_nothing() -> TestResult {
    let mut f = fixture(repo(&[("web", 3), ("api", 2)]), |_| {})?;
    f.scope.poll_source().await?;
    f.cluster.clear_journal();

    let again = f.scope.sync_now(SyncTrigger::Manual).await.ok_or("nothing compiled")?;

    assert_eq!(again.applied_count(), 0);
    assert_eq!(again.status, SyncStatus::Synced);
    assert!(f.cluster.journal().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_compile_error_keeps_last_good_desired_set() -> TestResult {
    // Given: a scope synced at a good revision
    let mut f = fixture(repo(&[("web", 3)]), |_| {})?;
    f.scope.poll_source().await?;
    let good = f.scope.desired().map(|d| d.revision.clone()).ok_or("no desired set")?;

    // When: a broken document lands
    f.backend.put("base/broken.yaml", "kind: Deployment\nmetadata: [\n").await;
    let outcome = f.scope.poll_source().await;

    // Then: the error is recorded and the previous desired set stays in effect
    assert!(matches!(outcome, Err(Error::CompileError { .. })));
    assert_eq!(f.scope.desired().map(|d| d.revision.clone()), Some(good));
    assert!(f.scope.status().last_error.is_some());
    assert_eq!(replicas(&f.cluster, "web").await, Some(json!(3)));

    // When: the document is fixed
    f.backend.put("base/broken.yaml", deployment("worker", 1)).await;
    f.scope.poll_source().await?;

    // Then: the scope recovers
    assert!(f.scope.status().last_error.is_none());
    assert!(f.cluster.object(&key("worker")).await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_source_unavailable_after_bounded_retries() -> TestResult {
    let mut f = fixture(repo(&[("web", 3)]), |_| {})?;
    f.backend.fail_next(10);

    let outcome = f.scope.poll_source().await;

    assert!(matches!(outcome, Err(Error::SourceUnavailable { .. })));
    assert_eq!(f.backend.fetch_count(), 3);
    assert!(f.scope.desired().is_none());
    assert!(f.scope.status().last_error.is_some());
    Ok(())
}

#[tokio::test]
async fn test_manual_approval_blocks_until_approved() -> TestResult {
    // Given: a scope that requires approval
    let mut f = fixture(repo(&[("web", 3)]), |scope| {
        scope.policy.manual_approval_required = true;
    })?;

    // When: a revision arrives
    let blocked = f.scope.poll_source().await?.ok_or("no sync attempt")?;

    // Then: nothing is applied and the fingerprint waits for approval
    assert_eq!(blocked.phase, SyncPhase::Blocked);
    assert_eq!(blocked.applied_count(), 0);
    assert!(f.cluster.keys().await.is_empty());
    let pending = f.scope.status().pending_approval.ok_or("nothing pending")?;
    assert_eq!(Some(pending.clone()), f.scope.desired().map(|d| d.fingerprint()));

    // When: an operator approves
    let approved = f.scope.approve().await?;

    // Then: the approved set is applied
    assert_eq!(approved, pending);
    assert_eq!(replicas(&f.cluster, "web").await, Some(json!(3)));
    let status = f.scope.status();
    assert_eq!(status.status, SyncStatus::Synced);
    assert!(status.pending_approval.is_none());
    assert!(matches!(f.scope.approve().await, Err(Error::NothingToApprove { .. })));
    Ok(())
}

#[tokio::test]
async fn test_drift_with_self_heal_reapplies() -> TestResult {
    let mut f = fixture(repo(&[("web", 3)]), |scope| scope.policy.self_heal = true)?;
    f.scope.poll_source().await?;
    assert!(f.cluster.set_field(&key("web"), "spec.replicas", json!(5)).await);

    let report = f.scope.check_drift().await.ok_or("no desired set")?;

    assert!(report.has_drift());
    assert!(report.corrected);
    assert_eq!(replicas(&f.cluster, "web").await, Some(json!(3)));
    assert_eq!(f.scope.status().status, SyncStatus::Synced);
    Ok(())
}

#[tokio::test]
async fn test_self_heal_corrects_drift_with_automation_off() -> TestResult {
    // Given: automation off, self-heal on and a forced first sync
    let mut f = fixture(repo(&[("web", 3)]), |scope| {
        scope.policy.automated = false;
        scope.policy.self_heal = true;
    })?;
    f.scope.poll_source().await?;
    f.scope.sync_now(SyncTrigger::Manual).await.ok_or("nothing compiled")?;
    assert!(f.cluster.set_field(&key("web"), "spec.replicas", json!(5)).await);

    // When: the drift tick runs
    let report = f.scope.check_drift().await.ok_or("no desired set")?;

    // Then: the drift is corrected by a drift-triggered sync
    assert!(report.corrected);
    assert_eq!(replicas(&f.cluster, "web").await, Some(json!(3)));
    assert_eq!(f.scope.status().last_sync().map(|r| r.trigger), Some(SyncTrigger::Drift));
    Ok(())
}

#[tokio::test]
async fn test_drift_without_self_heal_is_only_reported() -> TestResult {
    let mut f = fixture(repo(&[("web", 3)]), |_| {})?;
    f.scope.poll_source().await?;
    assert!(f.cluster.set_field(&key("web"), "spec.replicas", json!(5)).await);
    f.cluster.clear_journal();

    let report = f.scope.check_drift().await.ok_or("no desired set")?;

    assert!(report.has_drift());
    assert!(!report.corrected);
    assert_eq!(report.drifted[0].changed_fields, vec!["spec.replicas".to_string()]);
    assert_eq!(replicas(&f.cluster, "web").await, Some(json!(5)));
    assert!(f.cluster.journal().is_empty());
    let status = f.scope.status();
    assert_eq!(status.status, SyncStatus::OutOfSync);
    assert_eq!(status.last_drift, Some(report));
    Ok(())
}

#[tokio::test]
async fn test_prune_deletes_removed_objects_after_writes() -> TestResult {
    // Given: two applied Deployments and pruning on
    let mut f = fixture(repo(&[("web", 3), ("api", 2)]), |scope| scope.policy.prune = true)?;
    f.scope.poll_source().await?;
    f.cluster.clear_journal();

    // When: api is removed and web is scaled in the same revision
    f.backend.commit(None, repo(&[("web", 4)])).await;
    let result = f.scope.poll_source().await?.ok_or("no sync attempt")?;

    // Then: the update lands before the delete
    assert_eq!(result.phase, SyncPhase::Succeeded);
    assert_eq!(
        f.cluster.journal(),
        vec![
            JournalEntry {
                op: ClusterOp::Update,
                key: key("web"),
            },
            JournalEntry {
                op: ClusterOp::Delete,
                key: key("api"),
            },
        ]
    );
    assert!(!f.scope.inventory().contains(&key("api")));
    Ok(())
}

#[tokio::test]
async fn test_orphan_without_prune_is_left_alone() -> TestResult {
    let mut f = fixture(repo(&[("web", 3), ("api", 2)]), |_| {})?;
    f.scope.poll_source().await?;
    f.cluster.clear_journal();

    f.backend.commit(None, repo(&[("web", 3)])).await;
    let result = f.scope.poll_source().await?.ok_or("no sync attempt")?;

    assert_eq!(result.status, SyncStatus::Synced);
    assert!(f.cluster.journal().is_empty());
    assert!(f.cluster.object(&key("api")).await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_health_timeout_degrades_then_recheck_without_reapply() -> TestResult {
    // Given: Deployments must report ready replicas immediately
    let mut f = fixture(repo(&[("web", 3)]), |scope| {
        scope.policy.health_checks = vec![HealthCheck {
            kind: "Deployment".into(),
            condition: HealthCondition::FieldPresent {
                path: "status.readyReplicas".into(),
            },
            timeout_secs: 0,
        }];
    })?;

    // When: the object is applied but never becomes ready
    let applied = f.scope.poll_source().await?.ok_or("no sync attempt")?;

    // Then: it is reported degraded
    assert_eq!(applied.status, SyncStatus::Degraded);
    assert_eq!(f.scope.status().status, SyncStatus::Degraded);

    // When: it becomes ready and the next drift tick runs
    assert!(f.cluster.set_field(&key("web"), "status.readyReplicas", json!(3)).await);
    f.cluster.clear_journal();
    f.scope.check_drift().await.ok_or("no desired set")?;

    // Then: health is re-checked without writing again
    let status = f.scope.status();
    assert_eq!(status.status, SyncStatus::Synced);
    assert_eq!(status.last_sync().map(|r| r.trigger), Some(SyncTrigger::Recheck));
    assert!(f.cluster.journal().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_blocked_sync_keeps_degraded_objects_for_recheck() -> TestResult {
    // Given: an approval-gated scope whose Deployment is applied but never ready
    let mut f = fixture(repo(&[("web", 3)]), |scope| {
        scope.policy.manual_approval_required = true;
        scope.policy.health_checks = vec![HealthCheck {
            kind: "Deployment".into(),
            condition: HealthCondition::FieldPresent {
                path: "status.readyReplicas".into(),
            },
            timeout_secs: 0,
        }];
    })?;
    f.scope.poll_source().await?;
    f.scope.approve().await?;
    assert_eq!(f.scope.status().status, SyncStatus::Degraded);

    // When: a revision adding a ConfigMap is blocked and then approved
    let mut files = repo(&[("web", 3)]);
    files.insert(
        "base/flags.yaml".to_string(),
        "kind: ConfigMap\nmetadata:\n  name: flags\ndata:\n  beta: \"on\"\n".to_string(),
    );
    f.backend.commit(None, files).await;
    let blocked = f.scope.poll_source().await?.ok_or("no sync attempt")?;
    assert_eq!(blocked.phase, SyncPhase::Blocked);
    f.scope.approve().await?;

    // Then: the still-degraded Deployment is re-checked in the approved sync
    let status = f.scope.status();
    let approved = status.last_sync().ok_or("no sync recorded")?;
    assert_eq!(approved.trigger, SyncTrigger::Approval);
    assert!(matches!(
        approved.outcome(&key("web")).map(|o| &o.health),
        Some(HealthState::Degraded(_))
    ));
    assert_eq!(status.status, SyncStatus::Degraded);
    Ok(())
}

#[tokio::test]
async fn test_automation_off_reports_until_forced() -> TestResult {
    let mut f = fixture(repo(&[("web", 3)]), |scope| scope.policy.automated = false)?;

    let polled = f.scope.poll_source().await?;
    assert!(polled.is_none());
    assert_eq!(f.scope.status().status, SyncStatus::OutOfSync);
    assert!(f.cluster.keys().await.is_empty());

    let forced = f.scope.sync_now(SyncTrigger::Manual).await.ok_or("nothing compiled")?;
    assert_eq!(forced.status, SyncStatus::Synced);
    assert_eq!(replicas(&f.cluster, "web").await, Some(json!(3)));
    Ok(())
}

#[tokio::test]
async fn test_history_is_bounded() -> TestResult {
    let mut f = fixture(repo(&[("web", 3)]), |scope| scope.history_limit = 2)?;
    f.scope.poll_source().await?;
    f.scope.sync_now(SyncTrigger::Manual).await;
    f.scope.sync_now(SyncTrigger::Manual).await;

    let history = f.scope.status().history;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.trigger == SyncTrigger::Manual));
    Ok(())
}

#[tokio::test]
async fn test_controller_runs_scopes_and_stops() -> TestResult {
    // Given: a controller running one scope
    let backend = Arc::new(InMemoryBackend::new(repo(&[("web", 3)])));
    let cluster = Arc::new(InMemoryCluster::new());
    let config = scope_config(|_| {})?;
    let controller = Controller::start_with(vec![(config, tracker(backend)?, cluster.clone())]);
    let registry = controller.registry();
    let handle = registry.get("shop")?.clone();

    // When: the first source tick has been processed
    let mut updates = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| s.status == SyncStatus::Synced)).await??;

    // Then: the object is live and the scope answers commands
    assert!(cluster.object(&key("web")).await.is_some());
    assert!(matches!(registry.get("missing"), Err(Error::ScopeNotFound { .. })));
    handle.request_sync().await?;
    assert!(matches!(handle.approve().await, Err(Error::NothingToApprove { .. })));
    assert_eq!(registry.statuses().len(), 1);

    // When: the controller shuts down
    controller.shutdown().await;

    // Then: the handle reports the scope as stopped
    assert!(matches!(handle.request_sync().await, Err(Error::ScopeStopped { .. })));
    assert!(matches!(handle.cancel(), Err(Error::ScopeStopped { .. })));
    Ok(())
}
