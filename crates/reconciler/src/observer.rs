//! Observed-state reader.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use keel_core::{DesiredSet, Error, Limits, ObjectKey, ObservedObject, Result, TRACKING_LABEL};
use tracing::{debug, warn};

use crate::cluster::{ClusterApi, Selector};
use crate::types::{listing_key, Observation, ObservedState};

/// Reads the live state of the objects a scope cares about.
#[derive(Clone)]
pub struct ObservedStateReader {
    cluster: Arc<dyn ClusterApi>,
    scope: String,
    concurrency: usize,
    call_timeout: Duration,
}

impl ObservedStateReader {
    /// Create a reader for `scope`.
    pub fn new(cluster: Arc<dyn ClusterApi>, scope: impl Into<String>, limits: &Limits) -> Self {
        Self {
            cluster,
            scope: scope.into(),
            concurrency: limits.observe_concurrency.max(1),
            call_timeout: limits.call_timeout(),
        }
    }

    /// Observe every desired key plus the previously applied inventory.
    ///
    /// With `find_orphans`, objects carrying this scope's tracking label are
    /// listed per `(kind, namespace)` and added as well. A failed read turns
    /// into an [`Observation::Failed`] entry; it never aborts the whole read.
    /// A failed listing is recorded the same way under [`listing_key`].
    pub async fn observe(
        &self,
        desired: &DesiredSet,
        inventory: &BTreeSet<ObjectKey>,
        find_orphans: bool,
    ) -> ObservedState {
        let keys: BTreeSet<&ObjectKey> = desired.objects.keys().chain(inventory.iter()).collect();

        let reads: Vec<(ObjectKey, Observation)> = stream::iter(keys.iter().copied())
            .map(|key| async move { (key.clone(), self.read(key).await) })
            .buffer_unordered(self.concurrency)
            .boxed()
            .collect()
            .await;

        let mut state = ObservedState::new();
        for (key, observation) in reads {
            state.insert(key, observation);
        }

        if find_orphans {
            let groups: BTreeSet<(&str, &str)> = keys
                .iter()
                .map(|key| (key.kind.as_str(), key.namespace.as_str()))
                .collect();
            for ((kind, namespace), listing) in self.list_labelled(groups).await {
                match listing {
                    Ok(objects) => {
                        for orphan in objects {
                            if !state.entries.contains_key(&orphan.key) {
                                debug!(key = %orphan.key, "Found labelled object outside the desired set");
                                state.insert(orphan.key.clone(), Observation::Present(orphan));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(scope = %self.scope, kind, namespace, error = %e, "Orphan listing failed");
                        state.insert(
                            listing_key(kind, namespace),
                            Observation::Failed(format!("orphan listing failed: {e}")),
                        );
                    }
                }
            }
        }

        debug!(
            scope = %self.scope,
            observed = state.entries.len(),
            failed = state.failed_count(),
            "Observed live state"
        );
        state
    }

    async fn read(&self, key: &ObjectKey) -> Observation {
        match tokio::time::timeout(self.call_timeout, self.cluster.get(key)).await {
            Ok(Ok(Some(object))) => Observation::Present(object),
            Ok(Ok(None)) => Observation::Absent,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Observation failed");
                Observation::Failed(e.to_string())
            }
            Err(_) => {
                let e = Error::observation(
                    key.clone(),
                    format!("timed out after {}ms", self.call_timeout.as_millis()),
                );
                warn!(key = %key, error = %e, "Observation timed out");
                Observation::Failed(e.to_string())
            }
        }
    }

    async fn list_labelled<'a>(
        &self,
        groups: BTreeSet<(&'a str, &'a str)>,
    ) -> Vec<((&'a str, &'a str), Result<Vec<ObservedObject>>)> {
        let selector: Selector = [(TRACKING_LABEL.to_string(), self.scope.clone())]
            .into_iter()
            .collect();
        let selector = &selector;

        stream::iter(groups)
            .map(|(kind, namespace)| async move {
                let listing = tokio::time::timeout(self.call_timeout, self.cluster.list(kind, namespace, selector))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::observation(
                            listing_key(kind, namespace),
                            format!("list timed out after {}ms", self.call_timeout.as_millis()),
                        ))
                    });
                ((kind, namespace), listing)
            })
            .buffer_unordered(self.concurrency)
            .boxed()
            .collect()
            .await
    }
}
