//! Core types for the reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use keel_core::{DesiredObject, ObjectKey, ObservedObject, Revision};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Name used in the key of a failed listing, standing in for every object
/// of one `(kind, namespace)` group.
pub const ANY_NAME: &str = "*";

/// Key under which a failed listing of `kind` in `namespace` is recorded.
pub fn listing_key(kind: &str, namespace: &str) -> ObjectKey {
    ObjectKey::new(kind, namespace, ANY_NAME)
}

/// What the target environment reported for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The object exists.
    Present(ObservedObject),
    /// The object does not exist.
    Absent,
    /// The object could not be read.
    Failed(String),
}

/// Observations for every key of interest in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    /// Observation per key.
    pub entries: BTreeMap<ObjectKey, Observation>,
}

impl ObservedState {
    /// Create an empty observed state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation.
    pub fn insert(&mut self, key: ObjectKey, observation: Observation) {
        self.entries.insert(key, observation);
    }

    /// Observation for `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<&Observation> {
        self.entries.get(key)
    }

    /// Keys that exist in the environment.
    pub fn present_keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.entries
            .iter()
            .filter(|(_, o)| matches!(o, Observation::Present(_)))
            .map(|(key, _)| key)
    }

    /// Number of failed observations.
    pub fn failed_count(&self) -> usize {
        self.entries
            .values()
            .filter(|o| matches!(o, Observation::Failed(_)))
            .count()
    }
}

/// Kind of write implied by a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a missing object.
    Create,
    /// Update a live object.
    Update,
    /// Delete an undeclared object.
    Delete,
    /// No write.
    None,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

/// Per-object difference between desired and observed state.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Declared but absent.
    Create(DesiredObject),
    /// Present but different.
    Update {
        desired: DesiredObject,
        observed: ObservedObject,
        changed_fields: BTreeSet<String>,
    },
    /// Present, undeclared, and pruning requested.
    Delete(ObservedObject),
    /// Nothing to do.
    Unchanged(ObjectKey),
    /// Observation failed; the object is left alone.
    Unknown { key: ObjectKey, reason: String },
}

impl Delta {
    /// Key this delta concerns.
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Create(desired) | Self::Update { desired, .. } => &desired.key,
            Self::Delete(observed) => &observed.key,
            Self::Unchanged(key) | Self::Unknown { key, .. } => key,
        }
    }

    /// Write implied by this delta.
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Create(_) => Operation::Create,
            Self::Update { .. } => Operation::Update,
            Self::Delete(_) => Operation::Delete,
            Self::Unchanged(_) | Self::Unknown { .. } => Operation::None,
        }
    }

    /// Whether this delta requires a write.
    pub const fn is_change(&self) -> bool {
        !matches!(self.operation(), Operation::None)
    }

    /// Changed field paths (empty except for updates).
    pub fn changed_fields(&self) -> Vec<String> {
        match self {
            Self::Update { changed_fields, .. } => changed_fields.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

/// All deltas of one cycle, keyed by object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaSet {
    /// Delta per key.
    pub deltas: BTreeMap<ObjectKey, Delta>,
}

/// Delta counts per kind of change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub unchanged: usize,
    pub unknown: usize,
}

impl DeltaSet {
    /// Create an empty delta set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delta.
    pub fn insert(&mut self, delta: Delta) {
        self.deltas.insert(delta.key().clone(), delta);
    }

    /// Delta for `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<&Delta> {
        self.deltas.get(key)
    }

    /// Number of deltas.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Whether there are no deltas at all.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Creates and updates, in key order.
    pub fn writes(&self) -> impl Iterator<Item = &Delta> {
        self.deltas
            .values()
            .filter(|d| matches!(d.operation(), Operation::Create | Operation::Update))
    }

    /// Deletes, in key order.
    pub fn deletes(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values().filter(|d| d.operation() == Operation::Delete)
    }

    /// Every delta requiring a write.
    pub fn changes(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values().filter(|d| d.is_change())
    }

    /// Deltas whose observation failed.
    pub fn unknown(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values().filter(|d| matches!(d, Delta::Unknown { .. }))
    }

    /// Namespaces touched by a change.
    pub fn touched_namespaces(&self) -> BTreeSet<&str> {
        self.changes().map(|d| d.key().namespace.as_str()).collect()
    }

    /// Whether nothing needs to change and nothing is unknown.
    pub fn is_converged(&self) -> bool {
        self.deltas
            .values()
            .all(|d| matches!(d, Delta::Unchanged(_)))
    }

    /// Counts per kind of change.
    pub fn summary(&self) -> DeltaSummary {
        self.deltas
            .values()
            .fold(DeltaSummary::default(), |mut summary, delta| {
                match delta {
                    Delta::Create(_) => summary.create += 1,
                    Delta::Update { .. } => summary.update += 1,
                    Delta::Delete(_) => summary.delete += 1,
                    Delta::Unchanged(_) => summary.unchanged += 1,
                    Delta::Unknown { .. } => summary.unknown += 1,
                }
                summary
            })
    }
}

impl fmt::Display for DeltaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged, {} unknown",
            self.create, self.update, self.delete, self.unchanged, self.unknown
        )
    }
}

/// Terminal or in-flight phase of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Pending,
    Applying,
    Succeeded,
    PartiallyFailed,
    Blocked,
    Cancelled,
}

/// Overall state of a scope after a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Degraded,
    #[default]
    Unknown,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Synced => "synced",
            Self::OutOfSync => "out_of_sync",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What started a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// A new revision was compiled.
    Source,
    /// The drift monitor found a difference and self-heal is on.
    Drift,
    /// An operator requested a sync.
    Manual,
    /// An operator approved a blocked sync.
    Approval,
    /// Degraded objects are due for another health check.
    Recheck,
}

/// Result of the write for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum OutcomeState {
    /// The write succeeded.
    Applied,
    /// No write was needed.
    Unchanged,
    /// The write was not attempted.
    Skipped(String),
    /// The write failed.
    Failed(String),
}

/// Health of one object after the sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "health", content = "reason", rename_all = "snake_case")]
pub enum HealthState {
    /// The declared condition holds.
    Healthy,
    /// The condition did not hold before the deadline.
    Degraded(String),
    /// Health could not be determined.
    Unknown,
    /// No condition is declared, or no write happened.
    NotChecked,
}

/// Outcome of one object in a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectOutcome {
    pub key: ObjectKey,
    pub operation: Operation,
    pub state: OutcomeState,
    pub health: HealthState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

impl ObjectOutcome {
    /// Outcome for `delta` with the given state.
    pub fn new(delta: &Delta, state: OutcomeState) -> Self {
        Self {
            key: delta.key().clone(),
            operation: delta.operation(),
            state,
            health: HealthState::NotChecked,
            changed_fields: delta.changed_fields(),
        }
    }

    /// Set the health state.
    #[must_use]
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = health;
        self
    }

    /// Whether the write failed.
    pub const fn is_failed(&self) -> bool {
        matches!(self.state, OutcomeState::Failed(_))
    }

    /// Whether a change was left unapplied.
    pub fn is_skipped_change(&self) -> bool {
        matches!(self.state, OutcomeState::Skipped(_)) && self.operation != Operation::None
    }

    /// Whether the object ended up degraded.
    pub const fn is_degraded(&self) -> bool {
        matches!(self.health, HealthState::Degraded(_))
    }
}

/// Record of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub attempt_id: Ulid,
    pub revision: Revision,
    pub fingerprint: String,
    pub trigger: SyncTrigger,
    pub phase: SyncPhase,
    pub status: SyncStatus,
    pub outcomes: Vec<ObjectOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// Outcome for `key`, if the attempt recorded one.
    pub fn outcome(&self, key: &ObjectKey) -> Option<&ObjectOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }

    /// Number of objects actually written.
    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == OutcomeState::Applied)
            .count()
    }

    /// Keys reported degraded.
    pub fn degraded_keys(&self) -> BTreeSet<ObjectKey> {
        self.outcomes
            .iter()
            .filter(|o| o.is_degraded())
            .map(|o| o.key.clone())
            .collect()
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let counts = self.outcomes.iter().counts_by(|o| match o.state {
            OutcomeState::Applied => "applied",
            OutcomeState::Unchanged => "unchanged",
            OutcomeState::Skipped(_) => "skipped",
            OutcomeState::Failed(_) => "failed",
        });
        counts
            .into_iter()
            .sorted()
            .map(|(state, count)| format!("{count} {state}"))
            .join(", ")
    }
}

/// An object that differs from its declaration outside a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftedObject {
    pub key: ObjectKey,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

/// Result of one drift check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub revision: Revision,
    pub checked_at: DateTime<Utc>,
    pub drifted: Vec<DriftedObject>,
    pub unknown: Vec<ObjectKey>,
    /// Whether a corrective sync was started.
    pub corrected: bool,
}

impl DriftReport {
    /// Build a report from the deltas of a drift check.
    pub fn from_deltas(revision: Revision, deltas: &DeltaSet) -> Self {
        Self {
            revision,
            checked_at: Utc::now(),
            drifted: deltas
                .changes()
                .map(|d| DriftedObject {
                    key: d.key().clone(),
                    operation: d.operation(),
                    changed_fields: d.changed_fields(),
                })
                .collect(),
            unknown: deltas.unknown().map(|d| d.key().clone()).collect(),
            corrected: false,
        }
    }

    /// Whether any object drifted.
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }
}
