//! Sync executor: applies deltas subject to policy.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use keel_core::{DesiredSet, Error, Limits, ObjectKey, Result, SyncPolicy};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cancel::CancelSignal;
use crate::cluster::ClusterApi;
use crate::health::HealthChecker;
use crate::types::{
    Delta, DeltaSet, HealthState, ObjectOutcome, Operation, OutcomeState, SyncPhase, SyncResult, SyncStatus,
    SyncTrigger,
};

const AWAITING_APPROVAL: &str = "awaiting manual approval";

/// Everything one sync attempt works from.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    /// Desired state being applied.
    pub desired: &'a DesiredSet,
    /// Deltas computed against the live state.
    pub deltas: &'a DeltaSet,
    /// Unchanged keys whose health is checked again.
    pub recheck: &'a BTreeSet<ObjectKey>,
    /// Desired-set fingerprint an operator approved, if any.
    pub approval: Option<&'a str>,
    /// What started the attempt.
    pub trigger: SyncTrigger,
}

/// Applies a delta set to the target environment.
#[derive(Clone)]
pub struct SyncExecutor {
    cluster: Arc<dyn ClusterApi>,
    policy: SyncPolicy,
    concurrency: usize,
    call_timeout: Duration,
    health: HealthChecker,
}

impl SyncExecutor {
    /// Create an executor.
    pub fn new(cluster: Arc<dyn ClusterApi>, policy: SyncPolicy, limits: &Limits) -> Self {
        Self {
            health: HealthChecker::new(cluster.clone(), limits),
            cluster,
            policy,
            concurrency: limits.apply_concurrency.max(1),
            call_timeout: limits.call_timeout(),
        }
    }

    /// Policy in effect.
    pub const fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Whether any change in `deltas` touches a namespace gated by approval.
    pub fn requires_approval(&self, deltas: &DeltaSet) -> bool {
        deltas
            .touched_namespaces()
            .into_iter()
            .any(|namespace| self.policy.requires_approval(namespace))
    }

    /// Run one sync attempt.
    ///
    /// Creates and updates go first, concurrently and each with its own
    /// timeout, followed by health checks. Deletes run last, and only when
    /// every write succeeded, no key is unknown and `cancel` has not fired.
    /// Any unknown key leaves the attempt `PartiallyFailed`.
    pub async fn sync(&self, request: SyncRequest<'_>, cancel: &CancelSignal) -> SyncResult {
        let attempt_id = Ulid::new();
        let started_at = Utc::now();
        let fingerprint = request.desired.fingerprint();
        let deltas = request.deltas;

        info!(
            attempt = %attempt_id,
            revision = %request.desired.revision.short(),
            trigger = ?request.trigger,
            phase = ?SyncPhase::Pending,
            deltas = %deltas.summary(),
            "Sync started"
        );

        let unknown: Vec<ObjectOutcome> = deltas
            .deltas
            .values()
            .filter_map(|delta| match delta {
                Delta::Unknown { reason, .. } => Some(
                    ObjectOutcome::new(delta, OutcomeState::Skipped(format!("observation failed: {reason}")))
                        .with_health(HealthState::Unknown),
                ),
                _ => None,
            })
            .collect();

        if self.requires_approval(deltas) && request.approval != Some(fingerprint.as_str()) {
            let mut outcomes: Vec<ObjectOutcome> = deltas
                .changes()
                .map(|delta| ObjectOutcome::new(delta, OutcomeState::Skipped(AWAITING_APPROVAL.to_string())))
                .collect();
            outcomes.extend(unknown);
            info!(attempt = %attempt_id, "Sync blocked until approved");
            return Self::finish(
                request,
                attempt_id,
                fingerprint,
                started_at,
                SyncPhase::Blocked,
                outcomes,
            );
        }

        debug!(attempt = %attempt_id, phase = ?SyncPhase::Applying, "Applying writes");
        let mut outcomes: Vec<ObjectOutcome> = stream::iter(deltas.writes())
            .map(|delta| self.apply(delta, cancel))
            .buffer_unordered(self.concurrency)
            .boxed()
            .collect()
            .await;

        let rechecks: Vec<ObjectOutcome> = stream::iter(
            request
                .recheck
                .iter()
                .filter_map(|key| deltas.get(key))
                .filter(|delta| matches!(delta, Delta::Unchanged(_))),
        )
        .map(|delta| async move {
            let health = self.check_health(delta.key(), cancel).await;
            ObjectOutcome::new(delta, OutcomeState::Unchanged).with_health(health)
        })
        .buffer_unordered(self.concurrency)
        .boxed()
        .collect()
        .await;
        outcomes.extend(rechecks);

        let cancelled = cancel.is_cancelled();
        let failed_writes = outcomes.iter().filter(|o| o.is_failed()).count();
        let skip_reason = if cancelled {
            Some("sync cancelled before delete phase".to_string())
        } else if failed_writes > 0 {
            Some(format!("{failed_writes} create/update operations failed"))
        } else if !unknown.is_empty() {
            Some(format!("{} objects could not be observed", unknown.len()))
        } else {
            None
        };

        match skip_reason {
            Some(reason) => {
                let skipped = deltas.deletes().count();
                if skipped > 0 {
                    warn!(attempt = %attempt_id, skipped, reason = %reason, "Skipping deletes");
                }
                outcomes.extend(
                    deltas
                        .deletes()
                        .map(|delta| ObjectOutcome::new(delta, OutcomeState::Skipped(reason.clone()))),
                );
            }
            None => {
                let deleted: Vec<ObjectOutcome> = stream::iter(deltas.deletes())
                    .map(|delta| self.apply(delta, cancel))
                    .buffer_unordered(self.concurrency)
                    .boxed()
                    .collect()
                    .await;
                outcomes.extend(deleted);
            }
        }
        let has_unknown = !unknown.is_empty();
        outcomes.extend(unknown);

        let phase = if cancelled {
            SyncPhase::Cancelled
        } else if outcomes.iter().any(ObjectOutcome::is_failed) || has_unknown {
            SyncPhase::PartiallyFailed
        } else {
            SyncPhase::Succeeded
        };
        Self::finish(request, attempt_id, fingerprint, started_at, phase, outcomes)
    }

    fn finish(
        request: SyncRequest<'_>,
        attempt_id: Ulid,
        fingerprint: String,
        started_at: chrono::DateTime<Utc>,
        phase: SyncPhase,
        mut outcomes: Vec<ObjectOutcome>,
    ) -> SyncResult {
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        let status = if phase == SyncPhase::Blocked {
            SyncStatus::OutOfSync
        } else {
            overall_status(&outcomes)
        };
        let result = SyncResult {
            attempt_id,
            revision: request.desired.revision.clone(),
            fingerprint,
            trigger: request.trigger,
            phase,
            status,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            attempt = %attempt_id,
            phase = ?result.phase,
            status = %result.status,
            outcomes = %result.summary(),
            "Sync finished"
        );
        result
    }

    async fn apply(&self, delta: &Delta, cancel: &CancelSignal) -> ObjectOutcome {
        let key = delta.key();
        let written = match delta {
            Delta::Create(object) => self.call(key, self.cluster.create(object)).await,
            Delta::Update { desired, .. } => self.call(key, self.cluster.update(desired)).await,
            Delta::Delete(_) => self.call(key, self.cluster.delete(key)).await,
            Delta::Unchanged(_) | Delta::Unknown { .. } => {
                return ObjectOutcome::new(delta, OutcomeState::Unchanged);
            }
        };

        match written {
            Err(e) => {
                warn!(key = %key, operation = %delta.operation(), error = %e, "Apply failed");
                ObjectOutcome::new(delta, OutcomeState::Failed(e.to_string()))
            }
            Ok(()) => {
                debug!(key = %key, operation = %delta.operation(), "Applied");
                let outcome = ObjectOutcome::new(delta, OutcomeState::Applied);
                if delta.operation() == Operation::Delete {
                    return outcome;
                }
                let health = self.check_health(key, cancel).await;
                outcome.with_health(health)
            }
        }
    }

    async fn check_health(&self, key: &ObjectKey, cancel: &CancelSignal) -> HealthState {
        match self.policy.health_check_for(&key.kind) {
            Some(check) => self.health.wait(key, check, cancel).await,
            None => HealthState::NotChecked,
        }
    }

    async fn call(&self, key: &ObjectKey, write: impl Future<Output = Result<()>>) -> Result<()> {
        tokio::time::timeout(self.call_timeout, write)
            .await
            .unwrap_or_else(|_| {
                Err(Error::apply(
                    key.clone(),
                    format!("timed out after {}ms", self.call_timeout.as_millis()),
                ))
            })
    }
}

/// Overall status of a finished, unblocked attempt.
pub fn overall_status(outcomes: &[ObjectOutcome]) -> SyncStatus {
    if outcomes.iter().any(ObjectOutcome::is_failed) {
        SyncStatus::OutOfSync
    } else if outcomes.iter().any(|o| o.health == HealthState::Unknown) {
        SyncStatus::Unknown
    } else if outcomes.iter().any(ObjectOutcome::is_skipped_change) {
        SyncStatus::OutOfSync
    } else if outcomes.iter().any(ObjectOutcome::is_degraded) {
        SyncStatus::Degraded
    } else {
        SyncStatus::Synced
    }
}
