//! Core types, errors, and configuration for Keel.
//!
//! Every other crate in the workspace builds on the data model defined here:
//!
//! - [`ObjectKey`] identifies a resource by `(kind, namespace, name)`
//! - [`DesiredObject`] / [`DesiredSet`] describe what version control declares
//! - [`ObservedObject`] describes what the target environment currently runs
//! - [`SyncPolicy`] and [`DiffOptions`] steer how differences are resolved
//! - [`ControllerConfig`] is the on-disk configuration of a controller
//!
//! All fallible operations return [`Result`] - no panics allowed.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod fields;
pub mod policy;
pub mod types;

pub use config::{
    ControllerConfig, RetryConfig, ScopeConfig, ServerConfig, SourceConfig, SourceKind,
    TargetConfig, TargetKind,
};
pub use error::{Error, Result};
pub use policy::{values_equal, DiffOptions, HealthCheck, HealthCondition, Limits, SyncPolicy};
pub use types::{
    check_segment, Attributes, DesiredObject, DesiredSet, ObjectKey, ObservedObject, Revision,
    TRACKING_LABEL,
};
