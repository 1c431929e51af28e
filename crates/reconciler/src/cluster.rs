//! Access to the target environment.
//!
//! The controller never talks to an orchestration API directly; it goes
//! through [`ClusterApi`]. Two implementations ship with the crate:
//!
//! - [`InMemoryCluster`] keeps objects in memory, records every mutation in
//!   a journal and can inject failures. Used by tests and demos.
//! - [`DirectoryCluster`] stores each object as a JSON document under
//!   `<root>/<namespace>/<kind>/<name>.json`.
//!
//! Updates merge the declared attributes into the live object, so fields
//! the declaration does not mention (such as `status`) survive.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::types::{assemble_document, split_document};
use keel_core::{check_segment, fields, Attributes, DesiredObject, Error, ObjectKey, ObservedObject, Result};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::listing_key;

/// Label selector: every pair must be present on the object.
pub type Selector = BTreeMap<String, String>;

/// Operations against the target environment.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Human readable description for logs.
    fn describe(&self) -> String;

    /// Read one object; `None` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ObservedObject>>;

    /// List objects of `kind` in `namespace` carrying every label of `selector`.
    async fn list(&self, kind: &str, namespace: &str, selector: &Selector) -> Result<Vec<ObservedObject>>;

    /// Create an object that does not exist yet.
    async fn create(&self, object: &DesiredObject) -> Result<()>;

    /// Merge declared attributes into an existing object.
    async fn update(&self, object: &DesiredObject) -> Result<()>;

    /// Delete an object; deleting a missing object succeeds.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Deep-merge `patch` into `target`: mappings merge, everything else replaces.
pub fn merge_attributes(target: &mut Attributes, patch: &Attributes) {
    for (field, value) in patch {
        match (target.get_mut(field), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_attributes(existing, incoming),
            _ => {
                target.insert(field.clone(), value.clone());
            }
        }
    }
}

fn matches_selector(object: &ObservedObject, selector: &Selector) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels = object.labels();
    selector
        .iter()
        .all(|(label, value)| labels.get(label) == Some(value))
}

/// Mutation kinds recorded by [`InMemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterOp {
    Get,
    List,
    Create,
    Update,
    Delete,
}

/// One successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: ClusterOp,
    pub key: ObjectKey,
}

#[derive(Debug, Default)]
struct Faults {
    failing: BTreeSet<(ClusterOp, ObjectKey)>,
    failing_lists: bool,
    latency: Option<Duration>,
}

/// In-memory environment with fault injection and an operation journal.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    objects: RwLock<BTreeMap<ObjectKey, Attributes>>,
    journal: Mutex<Vec<JournalEntry>>,
    faults: Mutex<Faults>,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object directly, bypassing the journal.
    pub async fn seed(&self, key: ObjectKey, attributes: Attributes) {
        self.objects.write().await.insert(key, attributes);
    }

    /// Place a full document directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the document lacks identity fields.
    pub async fn seed_document(&self, document: Value) -> Result<()> {
        let (key, attributes) = split_document(document)?;
        self.seed(key, attributes).await;
        Ok(())
    }

    /// Change one field out of band, as an operator editing live state would.
    ///
    /// Returns `false` if the object does not exist or the path is blocked.
    pub async fn set_field(&self, key: &ObjectKey, path: &str, value: Value) -> bool {
        let mut objects = self.objects.write().await;
        objects
            .get_mut(key)
            .is_some_and(|attributes| fields::set(attributes, path, value).is_ok())
    }

    /// Remove an object out of band.
    pub async fn remove(&self, key: &ObjectKey) -> Option<Attributes> {
        self.objects.write().await.remove(key)
    }

    /// Current attributes of an object.
    pub async fn object(&self, key: &ObjectKey) -> Option<Attributes> {
        self.objects.read().await.get(key).cloned()
    }

    /// Keys of every stored object.
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Fail every `op` against `key` until faults are cleared.
    pub fn fail_on(&self, op: ClusterOp, key: ObjectKey) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing.insert((op, key));
        }
    }

    /// Fail every list call until faults are cleared.
    pub fn fail_lists(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_lists = true;
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.latency = Some(latency);
        }
    }

    /// Remove every injected fault and latency.
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Faults::default();
        }
    }

    /// Successful mutations in the order they happened.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Forget recorded mutations.
    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.clear();
        }
    }

    async fn check(&self, op: ClusterOp, key: Option<&ObjectKey>) -> std::result::Result<(), String> {
        let (latency, fail) = match self.faults.lock() {
            Ok(faults) => {
                let fail = match key {
                    Some(key) => faults.failing.contains(&(op, key.clone())),
                    None => faults.failing_lists,
                };
                (faults.latency, fail)
            }
            Err(_) => (None, false),
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fail {
            Err(format!("injected {op:?} failure"))
        } else {
            Ok(())
        }
    }

    fn record(&self, op: ClusterOp, key: &ObjectKey) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(JournalEntry { op, key: key.clone() });
        }
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ObservedObject>> {
        self.check(ClusterOp::Get, Some(key))
            .await
            .map_err(|reason| Error::observation(key.clone(), reason))?;
        let objects = self.objects.read().await;
        Ok(objects
            .get(key)
            .map(|attributes| ObservedObject::new(key.clone(), attributes.clone())))
    }

    async fn list(&self, kind: &str, namespace: &str, selector: &Selector) -> Result<Vec<ObservedObject>> {
        self.check(ClusterOp::List, None).await.map_err(|reason| {
            Error::observation(listing_key(kind, namespace), reason)
        })?;
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(key, _)| key.kind == kind && key.namespace == namespace)
            .map(|(key, attributes)| ObservedObject::new(key.clone(), attributes.clone()))
            .filter(|object| matches_selector(object, selector))
            .collect())
    }

    async fn create(&self, object: &DesiredObject) -> Result<()> {
        self.check(ClusterOp::Create, Some(&object.key))
            .await
            .map_err(|reason| Error::apply(object.key.clone(), reason))?;
        {
            let mut objects = self.objects.write().await;
            if objects.contains_key(&object.key) {
                return Err(Error::apply(object.key.clone(), "already exists"));
            }
            objects.insert(object.key.clone(), object.attributes.clone());
        }
        self.record(ClusterOp::Create, &object.key);
        Ok(())
    }

    async fn update(&self, object: &DesiredObject) -> Result<()> {
        self.check(ClusterOp::Update, Some(&object.key))
            .await
            .map_err(|reason| Error::apply(object.key.clone(), reason))?;
        {
            let mut objects = self.objects.write().await;
            let Some(existing) = objects.get_mut(&object.key) else {
                return Err(Error::apply(object.key.clone(), "not found"));
            };
            merge_attributes(existing, &object.attributes);
        }
        self.record(ClusterOp::Update, &object.key);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.check(ClusterOp::Delete, Some(key))
            .await
            .map_err(|reason| Error::apply(key.clone(), reason))?;
        self.objects.write().await.remove(key);
        self.record(ClusterOp::Delete, key);
        Ok(())
    }
}

/// Environment backed by JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryCluster {
    root: PathBuf,
}

impl DirectoryCluster {
    /// Create a cluster rooted at `root`; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding `key`; keys that would leave the root are rejected.
    fn path_of(&self, key: &ObjectKey) -> std::result::Result<PathBuf, String> {
        key.validate()?;
        Ok(self
            .root
            .join(&key.namespace)
            .join(&key.kind)
            .join(format!("{}.json", key.name)))
    }

    async fn read(&self, path: &Path) -> Result<Option<ObservedObject>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::file_read_failed(path, e.to_string())),
        };
        let document: Value =
            serde_json::from_str(&contents).map_err(|e| Error::json_parse_failed(format!("{}: {e}", path.display())))?;
        ObservedObject::from_document(document).map(Some)
    }

    async fn write(&self, key: &ObjectKey, attributes: &Attributes) -> Result<()> {
        let path = self.path_of(key).map_err(|reason| Error::apply(key.clone(), reason))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::apply(key.clone(), format!("{}: {e}", parent.display())))?;
        }
        let document = assemble_document(key, attributes);
        let contents = serde_json::to_string_pretty(&document)
            .map_err(|e| Error::apply(key.clone(), e.to_string()))?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::apply(key.clone(), format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Wrote object");
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for DirectoryCluster {
    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ObservedObject>> {
        let path = self.path_of(key).map_err(|reason| Error::observation(key.clone(), reason))?;
        self.read(&path)
            .await
            .map_err(|e| Error::observation(key.clone(), e.to_string()))
    }

    async fn list(&self, kind: &str, namespace: &str, selector: &Selector) -> Result<Vec<ObservedObject>> {
        let listing_error = |reason: String| Error::observation(listing_key(kind, namespace), reason);
        check_segment(namespace).and_then(|()| check_segment(kind)).map_err(listing_error)?;
        let dir = self.root.join(namespace).join(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(listing_error(format!("{}: {e}", dir.display()))),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| listing_error(format!("{}: {e}", dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(object) = self.read(&path).await.map_err(|e| listing_error(e.to_string()))? {
                if matches_selector(&object, selector) {
                    objects.push(object);
                }
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn create(&self, object: &DesiredObject) -> Result<()> {
        let path = self
            .path_of(&object.key)
            .map_err(|reason| Error::apply(object.key.clone(), reason))?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::apply(object.key.clone(), "already exists"));
        }
        self.write(&object.key, &object.attributes).await
    }

    async fn update(&self, object: &DesiredObject) -> Result<()> {
        let path = self
            .path_of(&object.key)
            .map_err(|reason| Error::apply(object.key.clone(), reason))?;
        let existing = self
            .read(&path)
            .await
            .map_err(|e| Error::apply(object.key.clone(), e.to_string()))?;
        let Some(mut live) = existing else {
            return Err(Error::apply(object.key.clone(), "not found"));
        };
        merge_attributes(&mut live.attributes, &object.attributes);
        self.write(&object.key, &live.attributes).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let path = self.path_of(key).map_err(|reason| Error::apply(key.clone(), reason))?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::apply(key.clone(), e.to_string())),
        }
    }
}
