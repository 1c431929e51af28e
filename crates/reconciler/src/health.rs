//! Bounded health polling after an apply.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{Error, HealthCheck, Limits, ObjectKey};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::cluster::ClusterApi;
use crate::types::HealthState;

/// Polls live objects until their declared condition holds.
#[derive(Clone)]
pub struct HealthChecker {
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl HealthChecker {
    /// Create a checker.
    pub fn new(cluster: Arc<dyn ClusterApi>, limits: &Limits) -> Self {
        Self {
            cluster,
            poll_interval: limits.health_poll_interval(),
            call_timeout: limits.call_timeout(),
        }
    }

    /// Poll `key` until `check` holds, its deadline passes, or `cancel` fires.
    ///
    /// Returns [`HealthState::Degraded`] past the deadline and
    /// [`HealthState::Unknown`] when cancelled first.
    pub async fn wait(&self, key: &ObjectKey, check: &HealthCheck, cancel: &CancelSignal) -> HealthState {
        let started = Instant::now();
        let deadline = started + check.timeout();
        let mut polls = 0u32;

        loop {
            polls = polls.saturating_add(1);
            let reason = match tokio::time::timeout(self.call_timeout, self.cluster.get(key)).await {
                Ok(Ok(Some(live))) => match check.condition.evaluate(&live.attributes) {
                    Ok(()) => {
                        debug!(key = %key, polls, "Object healthy");
                        return HealthState::Healthy;
                    }
                    Err(reason) => reason,
                },
                Ok(Ok(None)) => "object not found".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("read timed out after {}ms", self.call_timeout.as_millis()),
            };

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(now.duration_since(started).as_millis()).unwrap_or(u64::MAX);
                let error = Error::health_check_timeout(key.clone(), waited_ms, reason);
                warn!(key = %key, polls, error = %error, "Health check timed out");
                return HealthState::Degraded(error.to_string());
            }
            if cancel.is_cancelled() {
                return HealthState::Unknown;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            if cancel.is_cancelled() {
                return HealthState::Unknown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::cluster::InMemoryCluster;
    use keel_core::{Attributes, HealthCondition};
    use serde_json::json;

    fn limits() -> Limits {
        Limits {
            health_poll_interval_ms: 5,
            ..Limits::default()
        }
    }

    fn ready_check(timeout_secs: u64) -> HealthCheck {
        HealthCheck {
            kind: "Deployment".into(),
            condition: HealthCondition::FieldEquals {
                path: "status.ready".into(),
                value: json!(true),
            },
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_becomes_healthy_when_condition_turns_true() {
        let cluster = Arc::new(InMemoryCluster::new());
        let key = ObjectKey::new("Deployment", "shop", "web");
        cluster.seed(key.clone(), Attributes::new()).await;

        let flip = {
            let cluster = cluster.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cluster.set_field(&key, "status.ready", json!(true)).await
            })
        };

        let checker = HealthChecker::new(cluster, &limits());
        let health = checker.wait(&key, &ready_check(5), &CancelSignal::never()).await;
        assert_eq!(health, HealthState::Healthy);
        assert!(flip.await.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_degraded_after_deadline() {
        let cluster = Arc::new(InMemoryCluster::new());
        let key = ObjectKey::new("Deployment", "shop", "web");
        cluster.seed(key.clone(), Attributes::new()).await;

        let checker = HealthChecker::new(cluster, &limits());
        let health = checker.wait(&key, &ready_check(0), &CancelSignal::never()).await;
        assert!(matches!(health, HealthState::Degraded(reason) if reason.contains("status.ready")));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let cluster = Arc::new(InMemoryCluster::new());
        let key = ObjectKey::new("Deployment", "shop", "web");
        cluster.seed(key.clone(), Attributes::new()).await;
        let (trigger, signal) = cancellation();
        trigger.cancel();

        let checker = HealthChecker::new(cluster, &limits());
        let health = tokio::time::timeout(Duration::from_secs(2), checker.wait(&key, &ready_check(60), &signal)).await;
        assert_eq!(health.ok(), Some(HealthState::Unknown));
    }
}
