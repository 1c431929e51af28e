//! Controller: spawns one scope loop per configured scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{ControllerConfig, Error, Result, ScopeConfig, TargetKind};
use keel_source::SourceTracker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, DirectoryCluster, InMemoryCluster};
use crate::r#loop::{ScopeHandle, ScopeLoop, ScopeStatus};

/// Lookup of running scopes by name.
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    scopes: Arc<BTreeMap<String, ScopeHandle>>,
}

impl ScopeRegistry {
    /// Handle of `name`.
    ///
    /// # Errors
    ///
    /// Returns `ScopeNotFound` if no scope has that name.
    pub fn get(&self, name: &str) -> Result<&ScopeHandle> {
        self.scopes.get(name).ok_or_else(|| Error::scope_not_found(name))
    }

    /// Every handle, ordered by name.
    pub fn all(&self) -> impl Iterator<Item = &ScopeHandle> {
        self.scopes.values()
    }

    /// Status of every scope, ordered by name.
    pub fn statuses(&self) -> Vec<ScopeStatus> {
        self.all().map(ScopeHandle::status).collect()
    }

    /// Number of scopes.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether no scope is registered.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Running set of scope tasks.
pub struct Controller {
    registry: ScopeRegistry,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Start every scope in `config` with the target it declares.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a source cannot be built or a directory
    /// target has no location.
    pub fn start(config: &ControllerConfig) -> Result<Self> {
        let scopes = config
            .scopes
            .iter()
            .map(|scope| -> Result<(ScopeConfig, SourceTracker, Arc<dyn ClusterApi>)> {
                Ok((scope.clone(), SourceTracker::from_config(&scope.source)?, target(scope)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::start_with(scopes))
    }

    /// Start scopes from prebuilt trackers and targets.
    pub fn start_with(scopes: Vec<(ScopeConfig, SourceTracker, Arc<dyn ClusterApi>)>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::with_capacity(scopes.len());

        for (config, tracker, cluster) in scopes {
            let (scope, handle) = ScopeLoop::new(&config, tracker, cluster);
            tasks.push(tokio::spawn(scope.run(shutdown_rx.clone())));
            handles.insert(config.name.clone(), handle);
        }
        info!(scopes = handles.len(), "Controller started");

        Self {
            registry: ScopeRegistry {
                scopes: Arc::new(handles),
            },
            shutdown,
            tasks,
        }
    }

    /// Registry shared with the operational surface.
    pub fn registry(&self) -> ScopeRegistry {
        self.registry.clone()
    }

    /// Stop every scope and wait for its task to finish.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scope task ended abnormally");
            }
        }
        info!("Controller stopped");
    }
}

/// Build the target environment declared by `scope`.
///
/// # Errors
///
/// Returns `InvalidConfig` if a directory target has no location.
pub fn target(scope: &ScopeConfig) -> Result<Arc<dyn ClusterApi>> {
    match scope.target.kind {
        TargetKind::Memory => Ok(Arc::new(InMemoryCluster::new())),
        TargetKind::Directory => {
            let location = scope.target.location.as_ref().ok_or_else(|| {
                Error::invalid_config(format!("scope '{}': directory target needs a location", scope.name))
            })?;
            Ok(Arc::new(DirectoryCluster::new(location)))
        }
    }
}
