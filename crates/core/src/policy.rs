//! Sync policy, health-check declarations, diff options and limits.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields;
use crate::types::Attributes;

const DEFAULT_DRIFT_INTERVAL_SECS: u64 = 60;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 30;

/// How differences between desired and observed state are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Apply changes without an operator trigger.
    pub automated: bool,
    /// Delete live objects that are no longer declared.
    pub prune: bool,
    /// Correct drift without waiting for a new revision.
    pub self_heal: bool,
    /// Require an approval before applying changes in flagged namespaces.
    pub manual_approval_required: bool,
    /// Namespaces gated by `manual_approval_required`; empty gates all.
    pub approval_namespaces: BTreeSet<String>,
    /// Interval of the drift monitor.
    pub drift_interval_secs: u64,
    /// Health conditions per object kind.
    pub health_checks: Vec<HealthCheck>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            automated: true,
            prune: false,
            self_heal: false,
            manual_approval_required: false,
            approval_namespaces: BTreeSet::new(),
            drift_interval_secs: DEFAULT_DRIFT_INTERVAL_SECS,
            health_checks: Vec::new(),
        }
    }
}

impl SyncPolicy {
    /// Whether changes in `namespace` need an approval before applying.
    pub fn requires_approval(&self, namespace: &str) -> bool {
        self.manual_approval_required
            && (self.approval_namespaces.is_empty() || self.approval_namespaces.contains(namespace))
    }

    /// Health check declared for a kind, if any.
    pub fn health_check_for(&self, kind: &str) -> Option<&HealthCheck> {
        self.health_checks.iter().find(|check| check.kind == kind)
    }

    /// Drift monitor interval.
    pub const fn drift_interval(&self) -> Duration {
        Duration::from_secs(self.drift_interval_secs)
    }
}

/// Health condition declared for every object of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Kind the check applies to.
    pub kind: String,
    /// Condition that must hold on the live object.
    pub condition: HealthCondition,
    /// How long to wait for the condition after an apply.
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_health_timeout_secs() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

impl HealthCheck {
    /// Deadline for the condition to hold.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A condition evaluated against live attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCondition {
    /// `path` holds exactly `value`.
    FieldEquals { path: String, value: Value },
    /// `path` holds the same value as `equals` (e.g. ready vs desired replicas).
    FieldsMatch { path: String, equals: String },
    /// `path` is present and not null.
    FieldPresent { path: String },
}

impl HealthCondition {
    /// Evaluate the condition.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason when the condition does not hold.
    pub fn evaluate(&self, attributes: &Attributes) -> Result<(), String> {
        match self {
            Self::FieldEquals { path, value } => match fields::get(attributes, path) {
                Some(actual) if values_equal(actual, value) => Ok(()),
                Some(actual) => Err(format!("{path} is {actual}, want {value}")),
                None => Err(format!("{path} is not set")),
            },
            Self::FieldsMatch { path, equals } => {
                let left = fields::get(attributes, path);
                let right = fields::get(attributes, equals);
                match (left, right) {
                    (Some(l), Some(r)) if values_equal(l, r) => Ok(()),
                    (Some(l), Some(r)) => Err(format!("{path} is {l}, {equals} is {r}")),
                    (None, _) => Err(format!("{path} is not set")),
                    (_, None) => Err(format!("{equals} is not set")),
                }
            }
            Self::FieldPresent { path } => match fields::get(attributes, path) {
                Some(Value::Null) | None => Err(format!("{path} is not set")),
                Some(_) => Ok(()),
            },
        }
    }
}

/// JSON equality that treats numbers numerically (`3` equals `3.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x == y
                || matches!((x.as_f64(), y.as_f64()), (Some(x), Some(y)) if (x - y).abs() < f64::EPSILON)
        }
        _ => a == b,
    }
}

/// Options of the normalized comparison used by the diff engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Server-managed fields that are never compared.
    pub ignored_fields: Vec<String>,
    /// Fields compared even when absent from the desired object.
    pub managed_fields: Vec<String>,
    /// Lists compared as multisets rather than element by element.
    pub unordered_lists: Vec<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            ignored_fields: [
                "status",
                "metadata.uid",
                "metadata.resourceVersion",
                "metadata.generation",
                "metadata.creationTimestamp",
                "metadata.managedFields",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            managed_fields: Vec::new(),
            unordered_lists: Vec::new(),
        }
    }
}

impl DiffOptions {
    /// Whether a path is server-managed.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored_fields.iter().any(|f| f == path)
    }

    /// Whether a path is enforced even when not declared.
    pub fn is_managed(&self, path: &str) -> bool {
        self.managed_fields.iter().any(|f| f == path)
    }

    /// Whether a list at `path` is unordered.
    pub fn is_unordered(&self, path: &str) -> bool {
        self.unordered_lists.iter().any(|f| f == path)
    }
}

/// Concurrency and timeout limits of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Concurrent object reads.
    pub observe_concurrency: usize,
    /// Concurrent object writes.
    pub apply_concurrency: usize,
    /// Timeout of every call to the target environment.
    pub call_timeout_ms: u64,
    /// Delay between health polls.
    pub health_poll_interval_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            observe_concurrency: 8,
            apply_concurrency: 4,
            call_timeout_ms: 10_000,
            health_poll_interval_ms: 1_000,
        }
    }
}

impl Limits {
    /// Per-call timeout.
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Health poll interval.
    pub const fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_requires_approval_for_flagged_namespace_only() {
        let policy = SyncPolicy {
            manual_approval_required: true,
            approval_namespaces: ["prod".to_string()].into_iter().collect(),
            ..SyncPolicy::default()
        };
        assert!(policy.requires_approval("prod"));
        assert!(!policy.requires_approval("staging"));
    }

    #[test]
    fn test_requires_approval_everywhere_when_no_namespaces_flagged() {
        let policy = SyncPolicy {
            manual_approval_required: true,
            ..SyncPolicy::default()
        };
        assert!(policy.requires_approval("anything"));
        assert!(!SyncPolicy::default().requires_approval("anything"));
    }

    #[test]
    fn test_fields_match_condition() {
        let condition = HealthCondition::FieldsMatch {
            path: "status.readyReplicas".to_string(),
            equals: "spec.replicas".to_string(),
        };
        let ready = attrs(json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 3}}));
        let not_ready = attrs(json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 1}}));
        assert!(condition.evaluate(&ready).is_ok());
        assert!(condition.evaluate(&not_ready).is_err());
    }

    #[test]
    fn test_field_equals_treats_numbers_numerically() {
        let condition = HealthCondition::FieldEquals {
            path: "status.ready".to_string(),
            value: json!(1),
        };
        assert!(condition.evaluate(&attrs(json!({"status": {"ready": 1.0}}))).is_ok());
    }

    #[test]
    fn test_health_check_deserializes_tagged_condition() {
        let yaml = "kind: Deployment\ncondition:\n  type: field_present\n  path: status.readyReplicas\n";
        let check: std::result::Result<HealthCheck, _> = serde_yaml::from_str(yaml);
        assert!(check.is_ok());
        let timeout = check.map(|c| c.timeout_secs).unwrap_or_default();
        assert_eq!(timeout, DEFAULT_HEALTH_TIMEOUT_SECS);
    }

    #[test]
    fn test_default_diff_options_ignore_status() {
        let options = DiffOptions::default();
        assert!(options.is_ignored("status"));
        assert!(!options.is_ignored("spec"));
    }
}
