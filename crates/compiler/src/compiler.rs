//! Overlay expansion into a concrete desired set.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use itertools::Itertools;
use keel_core::{fields, values_equal, DesiredSet, Error, ObjectKey, Result, Revision, TRACKING_LABEL};
use keel_source::Snapshot;
use serde_json::Value;
use tracing::{debug, info};

use crate::document::{parse_file, Document, Resource};
use crate::overlay::{retag, ImagePatch, Overlay, CONTAINER_LISTS};

/// Compiles snapshots for one environment selector.
#[derive(Debug, Clone)]
pub struct Compiler {
    environment: String,
    scope: Option<String>,
}

impl Compiler {
    /// Create a compiler for `environment`.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            scope: None,
        }
    }

    /// Stamp every compiled object with the tracking label for `scope`.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// The environment selector.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Compile a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `CompileError` on malformed or conflicting input; nothing is
    /// returned partially.
    pub fn compile(&self, snapshot: &Snapshot) -> Result<DesiredSet> {
        self.compile_files(snapshot.revision.clone(), &snapshot.files)
    }

    /// Compile a file tree keyed by relative path.
    ///
    /// # Errors
    ///
    /// See [`Compiler::compile`].
    pub fn compile_files(&self, revision: Revision, files: &BTreeMap<String, String>) -> Result<DesiredSet> {
        let tree = Tree::parse(files)?;

        let mut selected = Vec::new();
        for dir in tree.dirs.keys() {
            if let Some(found) = tree.overlay_in(dir, Some(&self.environment))? {
                selected.push((dir.as_str(), found));
            }
        }
        if selected.is_empty() {
            return Err(Error::compile(
                ".",
                format!("no overlay serves environment '{}'", self.environment),
            ));
        }

        let mut desired = DesiredSet::new(revision, self.environment.clone());
        let mut producers: BTreeMap<ObjectKey, &str> = BTreeMap::new();
        for (dir, (file, overlay)) in selected {
            let mut expansion = Expansion {
                tree: &tree,
                stack: Vec::new(),
            };
            let resources = expansion.overlay(dir, file, overlay)?;
            debug!(overlay = %file, objects = resources.len(), "Expanded overlay");

            for resource in resources {
                let mut object = resource.into_object()?;
                if let Some(scope) = &self.scope {
                    fields::set_label(&mut object.attributes, TRACKING_LABEL, scope)
                        .map_err(|reason| Error::compile(file.as_str(), format!("{}: {reason}", object.key)))?;
                }
                match producers.entry(object.key.clone()) {
                    Entry::Occupied(first) => {
                        return Err(Error::compile(
                            file.as_str(),
                            format!("{} is also produced by '{}'", object.key, first.get()),
                        ));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(file.as_str());
                    }
                }
                desired.insert(object);
            }
        }

        info!(
            environment = %self.environment,
            revision = %desired.revision.short(),
            objects = desired.len(),
            "Compiled desired set"
        );
        Ok(desired)
    }
}

/// Documents grouped by the directory holding them.
#[derive(Debug, Default)]
struct Directory {
    resources: Vec<Resource>,
    overlays: Vec<(String, Overlay)>,
}

#[derive(Debug, Default)]
struct Tree {
    dirs: BTreeMap<String, Directory>,
}

impl Tree {
    fn parse(files: &BTreeMap<String, String>) -> Result<Self> {
        let mut tree = Self::default();
        for (path, contents) in files {
            let directory = tree.dirs.entry(parent_dir(path).to_string()).or_default();
            for document in parse_file(path, contents)? {
                match document {
                    Document::Resource(resource) => directory.resources.push(resource),
                    Document::Overlay(overlay) => directory.overlays.push((path.clone(), overlay)),
                }
            }
        }
        Ok(tree)
    }

    /// The single overlay in `dir` serving `environment`, if any.
    fn overlay_in(&self, dir: &str, environment: Option<&str>) -> Result<Option<&(String, Overlay)>> {
        let Some(directory) = self.dirs.get(dir) else {
            return Ok(None);
        };
        let mut matching = directory.overlays.iter().filter(|(_, o)| o.serves(environment));
        let first = matching.next();
        if let Some((second, _)) = matching.next() {
            let serving = environment.map_or_else(|| "nested use".to_string(), |e| format!("environment '{e}'"));
            return Err(Error::compile(
                second.as_str(),
                format!("directory '{}' has more than one overlay for {serving}", display_dir(dir)),
            ));
        }
        Ok(first)
    }
}

/// Override location recording a `nameSuffix` rename.
const RENAME: &str = "metadata.name";

/// One depth-first expansion, tracking the overlay directories entered.
struct Expansion<'a> {
    tree: &'a Tree,
    stack: Vec<String>,
}

impl Expansion<'_> {
    /// Resources contributed by `dir` when used as a base.
    fn base(&mut self, dir: &str, referrer: &str) -> Result<Vec<Resource>> {
        let tree = self.tree;
        if let Some((file, overlay)) = tree.overlay_in(dir, None)? {
            return self.overlay(dir, file, overlay);
        }
        let resources = tree
            .dirs
            .get(dir)
            .map(|d| d.resources.clone())
            .unwrap_or_default();
        if resources.is_empty() {
            return Err(Error::compile(
                referrer,
                format!("base '{}' contains no resource documents", display_dir(dir)),
            ));
        }
        ensure_unique(&resources, referrer)?;
        Ok(resources)
    }

    fn overlay(&mut self, dir: &str, file: &str, overlay: &Overlay) -> Result<Vec<Resource>> {
        if self.stack.iter().any(|entered| entered == dir) {
            let chain = self.stack.iter().map(|d| display_dir(d)).join(" -> ");
            return Err(Error::compile(
                file,
                format!("overlay cycle: {chain} -> {}", display_dir(dir)),
            ));
        }
        let base = resolve_dir(dir, &overlay.base).ok_or_else(|| {
            Error::compile(file, format!("base '{}' escapes the source tree", overlay.base))
        })?;

        self.stack.push(dir.to_string());
        let expanded = self.base(&base, file);
        self.stack.pop();
        let mut resources = expanded?;

        let tree = self.tree;
        if let Some(directory) = tree.dirs.get(dir) {
            resources.extend(directory.resources.iter().cloned());
        }
        ensure_unique(&resources, file)?;

        apply_patches(file, overlay, &mut resources)?;
        for resource in &mut resources {
            for (key, value) in &overlay.common_labels {
                resource.record_override(file, &format!("metadata.labels.{key}"), &Value::String(value.clone()))?;
                fields::set_label(&mut resource.attributes, key, value)
                    .map_err(|reason| Error::compile(file, format!("{}: {reason}", resource.label())))?;
            }
            if let Some(namespace) = &overlay.namespace {
                resource.record_override(file, "metadata.namespace", &Value::String(namespace.clone()))?;
                resource.namespace = Some(namespace.clone());
            }
            if let Some(suffix) = &overlay.name_suffix {
                if let Some((_, by)) = resource.overrides.get(RENAME) {
                    return Err(Error::compile(
                        file,
                        format!("{} is already renamed by '{by}'", resource.label()),
                    ));
                }
                resource.record_override(file, RENAME, &Value::String(suffix.clone()))?;
                resource.name.push_str(suffix);
            }
        }
        ensure_unique(&resources, file)?;
        Ok(resources)
    }
}

/// A single location written by a patch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum PatchWrite {
    Field(String),
    ContainerImage {
        list: &'static str,
        position: usize,
        container: String,
    },
}

impl std::fmt::Display for PatchWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(path) => f.write_str(path),
            Self::ContainerImage { list, container, .. } => write!(f, "{list}[{container}].image"),
        }
    }
}

/// Apply every patch of `overlay`, rejecting writes that disagree.
fn apply_patches(file: &str, overlay: &Overlay, resources: &mut [Resource]) -> Result<()> {
    let mut writes: BTreeMap<(usize, PatchWrite), Value> = BTreeMap::new();

    for patch in &overlay.patches {
        let targets: Vec<usize> = resources
            .iter()
            .positions(|r| r.is(&patch.target.kind, &patch.target.name))
            .collect();
        if targets.is_empty() {
            return Err(Error::compile(
                file,
                format!("patch targets unknown object {}", patch.target),
            ));
        }

        for index in targets {
            let resource = &resources[index];
            let mut planned: Vec<(PatchWrite, Value)> = patch
                .field_assignments()
                .into_iter()
                .map(|(path, value)| (PatchWrite::Field(path), value))
                .collect();
            if let Some(image) = &patch.image {
                let images = image_writes(resource, image);
                if images.is_empty() {
                    let which = image
                        .container
                        .as_deref()
                        .map_or_else(|| "any container".to_string(), |c| format!("container '{c}'"));
                    return Err(Error::compile(
                        file,
                        format!("image patch for {} matches no {which}", resource.label()),
                    ));
                }
                planned.extend(images);
            }

            for (write, value) in planned {
                match writes.entry((index, write)) {
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                    Entry::Occupied(existing) if !values_equal(existing.get(), &value) => {
                        return Err(Error::compile(
                            file,
                            format!(
                                "conflicting patches for {} field '{}': {} vs {value}",
                                resource.label(),
                                existing.key().1,
                                existing.get()
                            ),
                        ));
                    }
                    Entry::Occupied(_) => {}
                }
            }
        }
    }

    for ((index, write), value) in writes {
        let resource = &mut resources[index];
        resource.record_override(file, &write.to_string(), &value)?;
        let label = resource.label();
        match write {
            PatchWrite::Field(path) => fields::set(&mut resource.attributes, &path, value)
                .map_err(|reason| Error::compile(file, format!("{label}: {reason}")))?,
            PatchWrite::ContainerImage { list, position, .. } => {
                let slot = fields::get_mut(&mut resource.attributes, list)
                    .and_then(Value::as_array_mut)
                    .and_then(|containers| containers.get_mut(position))
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| Error::compile(file, format!("{label}: '{list}' changed while patching")))?;
                slot.insert("image".to_string(), value);
            }
        }
    }
    Ok(())
}

fn image_writes(resource: &Resource, image: &ImagePatch) -> Vec<(PatchWrite, Value)> {
    let mut writes = Vec::new();
    for list in CONTAINER_LISTS {
        let Some(containers) = fields::get(&resource.attributes, list).and_then(Value::as_array) else {
            continue;
        };
        for (position, container) in containers.iter().enumerate() {
            let name = container.get("name").and_then(Value::as_str).unwrap_or_default();
            if !image.applies_to(name) {
                continue;
            }
            let Some(current) = container.get("image").and_then(Value::as_str) else {
                continue;
            };
            writes.push((
                PatchWrite::ContainerImage {
                    list,
                    position,
                    container: name.to_string(),
                },
                Value::String(retag(current, &image.tag)),
            ));
        }
    }
    writes
}

fn ensure_unique(resources: &[Resource], file: &str) -> Result<()> {
    let duplicate = resources
        .iter()
        .map(|r| (&r.kind, &r.namespace, &r.name))
        .duplicates()
        .next();
    match duplicate {
        Some((kind, namespace, name)) => Err(Error::compile(
            file,
            format!(
                "duplicate object {kind}/{}/{name}",
                namespace.as_deref().unwrap_or("<unset>")
            ),
        )),
        None => Ok(()),
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn display_dir(dir: &str) -> &str {
    if dir.is_empty() { "." } else { dir }
}

/// Resolve `relative` against `dir`; `None` if it leaves the tree.
fn resolve_dir(dir: &str, relative: &str) -> Option<String> {
    if relative.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}
