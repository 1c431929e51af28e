//! Per-scope reconciliation loop.
//!
//! Each scope runs as one task that owns its revision pointer, compiled
//! desired set, inventory, approval token and sync history. Source ticks,
//! drift ticks and operator commands are handled one at a time from a single
//! `select!`, so a drift check never overlaps a sync. The only state shared
//! with the outside is a status snapshot published on a watch channel and a
//! cancellation trigger.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_compiler::Compiler;
use keel_core::{DesiredSet, Error, ObjectKey, Result, Revision, ScopeConfig, SyncPolicy};
use keel_source::{SourceTracker, SourceUpdate};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cancel::{cancellation, CancelTrigger};
use crate::cluster::ClusterApi;
use crate::diff::DiffEngine;
use crate::drift::DriftMonitor;
use crate::executor::{SyncExecutor, SyncRequest};
use crate::observer::ObservedStateReader;
use crate::types::{
    DeltaSet, DriftReport, Operation, OutcomeState, SyncPhase, SyncResult, SyncStatus, SyncTrigger, ANY_NAME,
};

const COMMAND_BUFFER: usize = 16;

/// Published state of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeStatus {
    pub scope: String,
    pub environment: String,
    /// Revision of the last successfully compiled desired set.
    pub revision: Option<Revision>,
    pub fingerprint: Option<String>,
    pub object_count: usize,
    pub status: SyncStatus,
    /// Phase of the last finished sync attempt.
    pub phase: Option<SyncPhase>,
    pub syncing: bool,
    /// Fingerprint of a desired set blocked on manual approval.
    pub pending_approval: Option<String>,
    pub last_error: Option<String>,
    pub last_drift: Option<DriftReport>,
    /// Finished sync attempts, oldest first.
    pub history: Vec<SyncResult>,
    pub updated_at: DateTime<Utc>,
}

impl ScopeStatus {
    fn new(scope: &str, environment: &str) -> Self {
        Self {
            scope: scope.to_string(),
            environment: environment.to_string(),
            revision: None,
            fingerprint: None,
            object_count: 0,
            status: SyncStatus::Unknown,
            phase: None,
            syncing: false,
            pending_approval: None,
            last_error: None,
            last_drift: None,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Most recent sync attempt.
    pub fn last_sync(&self) -> Option<&SyncResult> {
        self.history.last()
    }
}

/// Operator command delivered to a scope task.
#[derive(Debug)]
pub enum ScopeCommand {
    /// Sync now, whatever the automation setting.
    Sync,
    /// Approve the blocked desired set. The reply carries its fingerprint
    /// as soon as the approval is recorded; the sync runs afterwards.
    Approve(oneshot::Sender<Result<String>>),
}

/// Cloneable control surface of a running scope.
#[derive(Debug, Clone)]
pub struct ScopeHandle {
    name: String,
    status: watch::Receiver<ScopeStatus>,
    commands: mpsc::Sender<ScopeCommand>,
    cancel: Arc<CancelTrigger>,
}

impl ScopeHandle {
    /// Scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published status.
    pub fn status(&self) -> ScopeStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ScopeStatus> {
        self.status.clone()
    }

    /// Queue a forced sync.
    ///
    /// # Errors
    ///
    /// Returns `ScopeStopped` if the scope task has exited.
    pub async fn request_sync(&self) -> Result<()> {
        self.commands
            .send(ScopeCommand::Sync)
            .await
            .map_err(|_| Error::scope_stopped(&self.name))
    }

    /// Approve the desired set currently blocked on manual approval.
    ///
    /// Returns once the approval is recorded; the approved sync then runs on
    /// the scope task and shows up in the status.
    ///
    /// # Errors
    ///
    /// Returns `NothingToApprove` if no sync is blocked, or `ScopeStopped` if
    /// the scope task has exited.
    pub async fn approve(&self) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ScopeCommand::Approve(reply))
            .await
            .map_err(|_| Error::scope_stopped(&self.name))?;
        response.await.map_err(|_| Error::scope_stopped(&self.name))?
    }

    /// Cancel the in-flight sync. Returns whether one was running.
    ///
    /// # Errors
    ///
    /// Returns `ScopeStopped` if the scope task has exited.
    pub fn cancel(&self) -> Result<bool> {
        if self.commands.is_closed() {
            return Err(Error::scope_stopped(&self.name));
        }
        let syncing = self.status.borrow().syncing;
        if syncing {
            info!(scope = %self.name, "Cancelling in-flight sync");
            self.cancel.cancel();
        }
        Ok(syncing)
    }
}

/// Reconciliation state machine of one scope.
pub struct ScopeLoop {
    name: String,
    poll_interval: Duration,
    history_limit: usize,
    policy: SyncPolicy,
    tracker: SourceTracker,
    compiler: Compiler,
    reader: ObservedStateReader,
    engine: DiffEngine,
    executor: SyncExecutor,
    drift: DriftMonitor,
    desired: Option<DesiredSet>,
    inventory: BTreeSet<ObjectKey>,
    degraded: BTreeSet<ObjectKey>,
    approval: Option<String>,
    status: watch::Sender<ScopeStatus>,
    commands: mpsc::Receiver<ScopeCommand>,
    cancel: Arc<CancelTrigger>,
}

impl ScopeLoop {
    /// Build the loop for `config` and the handle that controls it.
    pub fn new(config: &ScopeConfig, tracker: SourceTracker, cluster: Arc<dyn ClusterApi>) -> (Self, ScopeHandle) {
        let (status_tx, status_rx) = watch::channel(ScopeStatus::new(&config.name, &config.environment));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (trigger, _) = cancellation();
        let cancel = Arc::new(trigger);

        let reader = ObservedStateReader::new(cluster.clone(), config.name.clone(), &config.limits);
        let engine = DiffEngine::new(config.diff.clone(), config.policy.prune);

        let scope = Self {
            name: config.name.clone(),
            poll_interval: config.source.poll_interval(),
            history_limit: config.history_limit.max(1),
            policy: config.policy.clone(),
            tracker,
            compiler: Compiler::new(config.environment.clone()).with_scope(config.name.clone()),
            drift: DriftMonitor::new(reader.clone(), engine.clone()),
            reader,
            engine,
            executor: SyncExecutor::new(cluster, config.policy.clone(), &config.limits),
            desired: None,
            inventory: BTreeSet::new(),
            degraded: BTreeSet::new(),
            approval: None,
            status: status_tx,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let handle = ScopeHandle {
            name: config.name.clone(),
            status: status_rx,
            commands: command_tx,
            cancel,
        };
        (scope, handle)
    }

    /// Scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last successfully compiled desired set.
    pub const fn desired(&self) -> Option<&DesiredSet> {
        self.desired.as_ref()
    }

    /// Keys this scope has applied and still tracks.
    pub const fn inventory(&self) -> &BTreeSet<ObjectKey> {
        &self.inventory
    }

    /// Current status snapshot.
    pub fn status(&self) -> ScopeStatus {
        self.status.borrow().clone()
    }

    /// Run until `shutdown` flips to `true` or every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let drift_every = self.policy.drift_interval();
        info!(
            scope = %self.name,
            poll_secs = self.poll_interval.as_secs(),
            drift_secs = drift_every.as_secs(),
            automated = self.policy.automated,
            "Starting scope loop"
        );

        let mut source_tick = tokio::time::interval(self.poll_interval);
        source_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drift_tick = tokio::time::interval_at(Instant::now() + drift_every, drift_every);
        drift_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = source_tick.tick() => {
                    if let Err(e) = self.poll_source().await {
                        warn!(scope = %self.name, error = %e, "Source cycle failed");
                    }
                }
                _ = drift_tick.tick() => {
                    self.check_drift().await;
                }
                command = self.commands.recv() => match command {
                    Some(ScopeCommand::Sync) => {
                        if self.sync_now(SyncTrigger::Manual).await.is_none() {
                            warn!(scope = %self.name, "Forced sync skipped: nothing compiled yet");
                        }
                    }
                    Some(ScopeCommand::Approve(reply)) => {
                        let approved = self.record_approval();
                        let accepted = approved.is_ok();
                        if reply.send(approved).is_err() {
                            debug!(scope = %self.name, "Approval requester went away");
                        }
                        if accepted {
                            self.sync_now(SyncTrigger::Approval).await;
                        }
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(scope = %self.name, "Scope loop stopped");
    }

    /// Poll the source; compile and reconcile when it changed.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` once fetch retries are exhausted, or
    /// `CompileError` for a broken revision. Either way the last good desired
    /// set stays in effect and the error is recorded in the status.
    pub async fn poll_source(&mut self) -> Result<Option<SyncResult>> {
        let snapshot = match self.tracker.poll().await {
            Ok(SourceUpdate::Changed(snapshot)) => snapshot,
            Ok(SourceUpdate::Unchanged) => return Ok(None),
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let desired = match self.compiler.compile(&snapshot) {
            Ok(desired) => desired,
            Err(e) => {
                error!(
                    scope = %self.name,
                    revision = %snapshot.revision.short(),
                    error = %e,
                    "Compile failed; keeping last good desired set"
                );
                self.record_error(&e);
                return Err(e);
            }
        };

        info!(
            scope = %self.name,
            revision = %desired.revision.short(),
            objects = desired.len(),
            "Compiled desired set"
        );
        self.status.send_modify(|status| {
            status.revision = Some(desired.revision.clone());
            status.fingerprint = Some(desired.fingerprint());
            status.object_count = desired.len();
            status.last_error = None;
            status.updated_at = Utc::now();
        });
        self.desired = Some(desired);
        self.reconcile(SyncTrigger::Source).await
    }

    /// Observe, diff and sync now, regardless of the automation setting.
    ///
    /// Returns `None` before the first successful compile.
    pub async fn sync_now(&mut self, trigger: SyncTrigger) -> Option<SyncResult> {
        let desired = self.desired.take()?;
        let deltas = self.observe_and_diff(&desired).await;
        let result = self.sync(&desired, &deltas, trigger).await;
        self.desired = Some(desired);
        Some(result)
    }

    /// Approve the blocked desired set and sync it.
    ///
    /// The approval is bound to the fingerprint that was blocked; a later
    /// revision with different content needs a fresh approval.
    ///
    /// # Errors
    ///
    /// Returns `NothingToApprove` if no sync is waiting for approval.
    pub async fn approve(&mut self) -> Result<String> {
        let fingerprint = self.record_approval()?;
        self.sync_now(SyncTrigger::Approval).await;
        Ok(fingerprint)
    }

    /// Record approval of the blocked desired set without syncing.
    ///
    /// # Errors
    ///
    /// Returns `NothingToApprove` if no sync is waiting for approval.
    pub fn record_approval(&mut self) -> Result<String> {
        let pending = self.status.borrow().pending_approval.clone();
        let Some(fingerprint) = pending else {
            return Err(Error::nothing_to_approve(&self.name));
        };
        info!(scope = %self.name, fingerprint = %short(&fingerprint), "Sync approved");
        self.approval = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    /// Compare the live environment with the last applied desired set.
    ///
    /// With self-heal on, drift starts a corrective sync whatever the
    /// automation setting; otherwise it is only reported. When nothing drifted but objects were
    /// left degraded, their health is checked again without re-applying.
    pub async fn check_drift(&mut self) -> Option<DriftReport> {
        let desired = self.desired.take()?;
        let (mut report, deltas) = self.drift.check(&desired, &self.inventory).await;

        if report.has_drift() && self.policy.self_heal {
            let result = self.sync(&desired, &deltas, SyncTrigger::Drift).await;
            report.corrected = result.phase != SyncPhase::Blocked;
        } else if !report.has_drift() && !self.degraded.is_empty() {
            self.sync(&desired, &deltas, SyncTrigger::Recheck).await;
        } else {
            let status = self.status_from(&deltas);
            self.status.send_modify(|s| {
                s.status = status;
                s.updated_at = Utc::now();
            });
        }

        self.desired = Some(desired);
        self.status.send_modify(|s| s.last_drift = Some(report.clone()));
        Some(report)
    }

    async fn reconcile(&mut self, trigger: SyncTrigger) -> Result<Option<SyncResult>> {
        if self.policy.automated {
            return Ok(self.sync_now(trigger).await);
        }
        let Some(desired) = self.desired.take() else {
            return Ok(None);
        };
        let deltas = self.observe_and_diff(&desired).await;
        let status = self.status_from(&deltas);
        debug!(scope = %self.name, deltas = %deltas.summary(), "Automation off; status refreshed");
        self.status.send_modify(|s| {
            s.status = status;
            s.updated_at = Utc::now();
        });
        self.desired = Some(desired);
        Ok(None)
    }

    async fn observe_and_diff(&self, desired: &DesiredSet) -> DeltaSet {
        let observed = self
            .reader
            .observe(desired, &self.inventory, self.engine.prunes())
            .await;
        self.engine.diff(desired, &observed)
    }

    async fn sync(&mut self, desired: &DesiredSet, deltas: &DeltaSet, trigger: SyncTrigger) -> SyncResult {
        self.cancel.reset();
        self.status.send_modify(|s| s.syncing = true);

        let request = SyncRequest {
            desired,
            deltas,
            recheck: &self.degraded,
            approval: self.approval.as_deref(),
            trigger,
        };
        let result = self.executor.sync(request, &self.cancel.signal()).await;

        // A blocked attempt touched nothing, so what was applied before still stands.
        if result.phase != SyncPhase::Blocked {
            self.degraded = result.degraded_keys();
            self.inventory = next_inventory(desired, &result);
        }

        let pending = (result.phase == SyncPhase::Blocked).then(|| result.fingerprint.clone());
        let limit = self.history_limit;
        self.status.send_modify(|s| {
            s.syncing = false;
            s.status = result.status;
            s.phase = Some(result.phase);
            s.pending_approval = pending;
            s.history.push(result.clone());
            if s.history.len() > limit {
                let excess = s.history.len() - limit;
                s.history.drain(..excess);
            }
            s.updated_at = Utc::now();
        });
        result
    }

    fn status_from(&self, deltas: &DeltaSet) -> SyncStatus {
        if deltas.changes().next().is_some() {
            SyncStatus::OutOfSync
        } else if deltas.unknown().next().is_some() {
            SyncStatus::Unknown
        } else if !self.degraded.is_empty() {
            SyncStatus::Degraded
        } else {
            SyncStatus::Synced
        }
    }

    fn record_error(&self, e: &Error) {
        let message = e.to_string();
        self.status.send_modify(|s| {
            s.last_error = Some(message);
            s.updated_at = Utc::now();
        });
    }
}

/// Desired keys plus every undeclared key that was not deleted.
///
/// Keys standing in for a failed listing are not objects and are dropped.
fn next_inventory(desired: &DesiredSet, result: &SyncResult) -> BTreeSet<ObjectKey> {
    let deleted = |key: &ObjectKey| {
        result
            .outcome(key)
            .is_some_and(|o| o.operation == Operation::Delete && o.state == OutcomeState::Applied)
    };
    desired
        .objects
        .keys()
        .cloned()
        .chain(
            result
                .outcomes
                .iter()
                .map(|o| &o.key)
                .filter(|key| key.name != ANY_NAME && !desired.objects.contains_key(*key) && !deleted(key))
                .cloned(),
        )
        .collect()
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
