//! Source tracking for Keel.
//!
//! The [`SourceTracker`] polls a version-control endpoint through a
//! [`SourceBackend`] and hands out a [`Snapshot`] only when the filtered
//! document tree actually changed:
//!
//! - [`DirectoryBackend`] reads a plain directory (revision = content digest)
//! - [`GitCliBackend`] reads a local clone through the `git` CLI
//! - [`InMemoryBackend`] serves scripted trees for tests and demos
//!
//! Unreachable endpoints are retried with bounded exponential backoff
//! ([`RetryPolicy`]) before `SourceUnavailable` is reported. A revision is
//! never fabricated.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backend;
pub mod filter;
pub mod retry;
pub mod snapshot;
pub mod tracker;

pub use backend::{DirectoryBackend, GitCliBackend, InMemoryBackend, SourceBackend, SourceTree};
pub use filter::PathFilter;
pub use retry::{RetryPolicy, RetryState};
pub use snapshot::Snapshot;
pub use tracker::{SourceTracker, SourceUpdate};
