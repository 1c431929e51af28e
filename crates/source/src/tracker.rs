//! Source tracker: hands out a snapshot only when the tracked tree changed.

use std::sync::Arc;

use keel_core::{Result, SourceConfig, SourceKind};
use tracing::{debug, info};

use crate::backend::{DirectoryBackend, GitCliBackend, SourceBackend};
use crate::filter::PathFilter;
use crate::retry::RetryPolicy;
use crate::snapshot::Snapshot;

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUpdate {
    /// The filtered tree differs from the last snapshot handed out.
    Changed(Snapshot),
    /// Nothing changed since the last snapshot.
    Unchanged,
}

/// Polls a backend and remembers the last snapshot it returned.
pub struct SourceTracker {
    backend: Arc<dyn SourceBackend>,
    branch: String,
    filter: PathFilter,
    retry: RetryPolicy,
    last_digest: Option<String>,
}

impl SourceTracker {
    /// Create a tracker.
    pub fn new(
        backend: Arc<dyn SourceBackend>,
        branch: impl Into<String>,
        filter: PathFilter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            branch: branch.into(),
            filter,
            retry,
            last_digest: None,
        }
    }

    /// Build a tracker and its backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the include patterns are invalid.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let backend: Arc<dyn SourceBackend> = match config.kind {
            SourceKind::Directory => Arc::new(DirectoryBackend::new(&config.location)),
            SourceKind::Git => {
                let backend = GitCliBackend::new(&config.location);
                Arc::new(match &config.remote {
                    Some(remote) => backend.with_remote(remote),
                    None => backend,
                })
            }
        };
        let filter = PathFilter::new(&config.path, &config.include)?;
        Ok(Self::new(
            backend,
            config.branch.clone(),
            filter,
            RetryPolicy::from(&config.retry),
        ))
    }

    /// Endpoint description of the backend.
    pub fn endpoint(&self) -> String {
        self.backend.endpoint()
    }

    /// Digest of the last snapshot handed out.
    pub fn last_digest(&self) -> Option<&str> {
        self.last_digest.as_deref()
    }

    /// Fetch the current snapshot regardless of what was returned before.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` once retries are exhausted.
    pub async fn fetch_latest(&self) -> Result<Snapshot> {
        let backend = &self.backend;
        let branch = self.branch.as_str();
        let filter = &self.filter;
        let tree = self
            .retry
            .run("source fetch", move |_| backend.fetch(branch, filter))
            .await?;
        Ok(Snapshot::new(tree.revision, tree.files))
    }

    /// Poll the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` once retries are exhausted; the last
    /// snapshot is kept so the next successful poll compares against it.
    pub async fn poll(&mut self) -> Result<SourceUpdate> {
        let snapshot = self.fetch_latest().await?;

        if self.last_digest.as_deref() == Some(snapshot.digest.as_str()) {
            debug!(revision = %snapshot.revision.short(), "Source unchanged");
            return Ok(SourceUpdate::Unchanged);
        }

        info!(
            endpoint = %self.endpoint(),
            revision = %snapshot.revision.short(),
            files = snapshot.len(),
            "New source revision"
        );
        self.last_digest = Some(snapshot.digest.clone());
        Ok(SourceUpdate::Changed(snapshot))
    }
}
