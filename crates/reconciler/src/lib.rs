//! Reconciliation of compiled desired state against a live environment.
//!
//! Every scope runs the same cycle:
//!
//! 1. **Observe**: read the live object for every desired and previously
//!    applied key, plus labelled orphans when pruning is on
//!    ([`ObservedStateReader`]).
//! 2. **Diff**: classify each key as create, update, delete, unchanged or
//!    unknown ([`DiffEngine`]). The diff is pure.
//! 3. **Sync**: apply the changes subject to policy, check health and prune
//!    last ([`SyncExecutor`]).
//!
//! Between source changes the [`DriftMonitor`] repeats observe and diff and,
//! with self-heal on, starts a corrective sync.
//!
//! # Example
//!
//! ```ignore
//! use keel_core::ControllerConfig;
//! use keel_reconciler::Controller;
//!
//! #[tokio::main]
//! async fn main() -> keel_core::Result<()> {
//!     let config = ControllerConfig::from_path("keel.toml".as_ref())?;
//!     let controller = Controller::start(&config)?;
//!
//!     for status in controller.registry().statuses() {
//!         println!("{}: {}", status.scope, status.status);
//!     }
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cancel;
pub mod cluster;
pub mod controller;
pub mod diff;
pub mod drift;
pub mod executor;
pub mod health;
pub mod r#loop;
pub mod observer;
pub mod types;

pub use keel_core::{Error, Result};

pub use cancel::{cancellation, CancelSignal, CancelTrigger};
pub use cluster::{ClusterApi, ClusterOp, DirectoryCluster, InMemoryCluster, JournalEntry, Selector};
pub use controller::{Controller, ScopeRegistry};
pub use diff::DiffEngine;
pub use drift::DriftMonitor;
pub use executor::{SyncExecutor, SyncRequest};
pub use health::HealthChecker;
pub use observer::ObservedStateReader;
pub use r#loop::{ScopeCommand, ScopeHandle, ScopeLoop, ScopeStatus};
pub use types::{
    listing_key, Delta, DeltaSet, DeltaSummary, DriftReport, DriftedObject, HealthState, ObjectOutcome, Observation,
    ObservedState, Operation, OutcomeState, SyncPhase, SyncResult, SyncStatus, SyncTrigger, ANY_NAME,
};
