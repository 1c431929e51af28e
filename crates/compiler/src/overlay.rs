//! Overlay documents: a base directory plus environment-specific patches.

use std::collections::BTreeMap;

use keel_core::{check_segment, Error, Result};
use serde::Deserialize;
use serde_json::Value;

/// `kind` value identifying an overlay document.
pub const OVERLAY_KIND: &str = "Overlay";

/// Lists searched for containers by image patches.
pub const CONTAINER_LISTS: [&str; 2] = ["spec.template.spec.containers", "spec.containers"];

/// Composition of a base directory with patches.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Overlay {
    /// Always [`OVERLAY_KIND`].
    pub kind: String,
    /// Accepted and ignored.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Accepted and ignored.
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Environment selector this overlay serves; `None` for nested overlays.
    #[serde(default)]
    pub environment: Option<String>,
    /// Base directory, relative to the directory holding this overlay.
    pub base: String,
    /// Namespace forced onto every object.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Suffix appended to every object name.
    #[serde(default)]
    pub name_suffix: Option<String>,
    /// Labels merged into every object's `metadata.labels`.
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    /// Patches applied to objects of the base.
    #[serde(default)]
    pub patches: Vec<Patch>,
}

impl Overlay {
    /// Check fields that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns `CompileError` naming `path` for empty selectors, bases,
    /// namespaces or patch targets, and for patches that change nothing.
    pub fn validate(&self, path: &str) -> Result<()> {
        let blank = |value: &Option<String>| value.as_deref().is_some_and(|v| v.trim().is_empty());
        if blank(&self.environment) {
            return Err(Error::compile(path, "overlay 'environment' must not be empty"));
        }
        if self.base.trim().is_empty() {
            return Err(Error::compile(path, "overlay 'base' must not be empty"));
        }
        if blank(&self.namespace) {
            return Err(Error::compile(path, "overlay 'namespace' must not be empty"));
        }
        for (field, value) in [("namespace", &self.namespace), ("nameSuffix", &self.name_suffix)] {
            if let Some(value) = value {
                check_segment(value).map_err(|reason| Error::compile(path, format!("overlay '{field}': {reason}")))?;
            }
        }
        for patch in &self.patches {
            if patch.target.kind.is_empty() || patch.target.name.is_empty() {
                return Err(Error::compile(path, "patch target needs both 'kind' and 'name'"));
            }
            if patch.is_empty() {
                return Err(Error::compile(
                    path,
                    format!("patch for {} changes nothing", patch.target),
                ));
            }
            if patch.set.keys().any(|field| field.trim_matches('.').is_empty()) {
                return Err(Error::compile(path, format!("patch for {} sets an empty path", patch.target)));
            }
        }
        Ok(())
    }

    /// Whether this overlay serves `environment` (`None` matches nested overlays).
    pub fn serves(&self, environment: Option<&str>) -> bool {
        self.environment.as_deref() == environment
    }
}

/// A patch against one object of the base.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Patch {
    /// Object to patch, as named in the base.
    pub target: PatchTarget,
    /// Sets `spec.replicas`.
    #[serde(default)]
    pub replicas: Option<u64>,
    /// Rewrites container image tags.
    #[serde(default)]
    pub image: Option<ImagePatch>,
    /// Dotted path to value assignments.
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
}

impl Patch {
    /// Whether the patch carries no operation.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_none() && self.image.is_none() && self.set.is_empty()
    }

    /// Plain field assignments, with `replicas` expanded to `spec.replicas`.
    pub fn field_assignments(&self) -> Vec<(String, Value)> {
        self.replicas
            .map(|replicas| ("spec.replicas".to_string(), Value::from(replicas)))
            .into_iter()
            .chain(self.set.iter().map(|(path, value)| (path.clone(), value.clone())))
            .collect()
    }
}

/// Identifies a patched object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchTarget {
    /// Object kind.
    pub kind: String,
    /// Object name.
    pub name: String,
}

impl std::fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Image tag rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagePatch {
    /// Container to rewrite; every container when omitted.
    #[serde(default)]
    pub container: Option<String>,
    /// New tag.
    pub tag: String,
}

impl ImagePatch {
    /// Whether a container named `name` is affected.
    pub fn applies_to(&self, name: &str) -> bool {
        self.container.as_deref().is_none_or(|wanted| wanted == name)
    }
}

/// Replace the tag of an image reference.
///
/// A registry port (`host:5000/app`) is not mistaken for a tag, and any
/// digest (`@sha256:...`) is dropped.
pub fn retag(image: &str, tag: &str) -> String {
    let reference = image.split_once('@').map_or(image, |(name, _)| name);
    let name_start = reference.rfind('/').map_or(0, |slash| slash + 1);
    let repository = reference
        .get(name_start..)
        .and_then(|name| name.rfind(':'))
        .and_then(|colon| reference.get(..name_start + colon))
        .unwrap_or(reference);
    format!("{repository}:{tag}")
}
