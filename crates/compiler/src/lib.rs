//! Desired-state compiler for Keel.
//!
//! Turns a [`Snapshot`](keel_source::Snapshot) of declarative documents into
//! a flat, concrete [`DesiredSet`](keel_core::DesiredSet) for one
//! environment.
//!
//! # Documents
//!
//! Resource documents carry `kind`, `metadata.name`, `metadata.namespace` and
//! a kind-specific payload:
//!
//! ```yaml
//! kind: Deployment
//! metadata:
//!   name: web
//!   namespace: shop
//! spec:
//!   replicas: 1
//!   template:
//!     spec:
//!       containers:
//!         - name: web
//!           image: registry.local/web:1.0.0
//! ```
//!
//! Overlay documents compose a base directory with environment patches:
//!
//! ```yaml
//! kind: Overlay
//! environment: production
//! base: ../../base
//! namespace: shop-prod
//! nameSuffix: -prod
//! patches:
//!   - target: { kind: Deployment, name: web }
//!     replicas: 3
//!     image: { container: web, tag: 1.2.0 }
//!     set:
//!       spec.strategy.type: RollingUpdate
//! ```
//!
//! Compilation is all-or-nothing: any malformed or conflicting input yields a
//! `CompileError` and no partial desired set.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod compiler;
pub mod document;
pub mod overlay;

pub use compiler::Compiler;
pub use document::{Document, Resource};
pub use overlay::{ImagePatch, Overlay, Patch, PatchTarget};
