//! Core data model shared by the compiler and the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fields;

/// Label stamped on every managed object, naming the scope that owns it.
pub const TRACKING_LABEL: &str = "keel.dev/scope";

/// Canonical attribute set of an object: everything except its identity.
pub type Attributes = Map<String, Value>;

/// Identity of a resource in the target environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Resource kind (e.g. `Deployment`).
    pub kind: String,
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Resource name, unique per kind and namespace.
    pub name: String,
}

impl ObjectKey {
    /// Create a new object key.
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Check that every identity component is usable as one path segment.
    ///
    /// # Errors
    ///
    /// Returns the reason for the first component that is rejected by
    /// [`check_segment`].
    pub fn validate(&self) -> std::result::Result<(), String> {
        [("kind", &self.kind), ("namespace", &self.namespace), ("name", &self.name)]
            .into_iter()
            .try_for_each(|(field, value)| check_segment(value).map_err(|reason| format!("{field} {reason}")))
    }
}

/// Reject identity values that cannot stand alone as a path segment.
///
/// # Errors
///
/// Returns a reason when `value` contains `/` or `\`, contains `..`, or
/// starts with `.`.
pub fn check_segment(value: &str) -> std::result::Result<(), String> {
    if value.contains(['/', '\\']) {
        Err(format!("'{value}' must not contain a path separator"))
    } else if value.starts_with('.') || value.contains("..") {
        Err(format!("'{value}' must not start with '.' or contain '..'"))
    } else {
        Ok(())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Immutable identifier of a snapshot of the declared configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wrap a revision identifier (commit id or content digest).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated identifier for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex-encoded SHA-256 of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

fn hex_encode(bytes: &[u8]) -> String {
    use fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Reassemble a full document from an identity key and its attributes.
pub fn assemble_document(key: &ObjectKey, attributes: &Attributes) -> Value {
    let mut document = attributes.clone();
    document.insert("kind".to_string(), Value::String(key.kind.clone()));
    let metadata = document
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(metadata) = metadata.as_object_mut() {
        metadata.insert("name".to_string(), Value::String(key.name.clone()));
        metadata.insert("namespace".to_string(), Value::String(key.namespace.clone()));
    }
    Value::Object(document)
}

/// Split a full document into its identity key and remaining attributes.
///
/// # Errors
///
/// Returns an error when the document is not a mapping or lacks `kind`,
/// `metadata.name` or `metadata.namespace`.
pub fn split_document(document: Value) -> Result<(ObjectKey, Attributes)> {
    let Value::Object(mut attributes) = document else {
        return Err(Error::json_parse_failed("document is not a mapping"));
    };
    let kind = take_string(&mut attributes, "kind")?;
    let name = take_string(&mut attributes, "metadata.name")?;
    let namespace = take_string(&mut attributes, "metadata.namespace")?;
    let metadata_empty = attributes
        .get("metadata")
        .and_then(Value::as_object)
        .is_some_and(Map::is_empty);
    if metadata_empty {
        attributes.remove("metadata");
    }
    Ok((ObjectKey::new(kind, namespace, name), attributes))
}

fn take_string(attributes: &mut Attributes, path: &str) -> Result<String> {
    match fields::remove(attributes, path) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(Error::json_parse_failed(format!("'{path}' must be a non-empty string"))),
        None => Err(Error::json_parse_failed(format!("missing required field '{path}'"))),
    }
}

/// A fully resolved target resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredObject {
    /// Identity key.
    pub key: ObjectKey,
    /// Canonical attribute set.
    pub attributes: Attributes,
}

impl DesiredObject {
    /// Create a desired object.
    pub const fn new(key: ObjectKey, attributes: Attributes) -> Self {
        Self { key, attributes }
    }

    /// Look up an attribute by dotted path.
    pub fn field(&self, path: &str) -> Option<&Value> {
        fields::get(&self.attributes, path)
    }

    /// The full document as it would be written to the target environment.
    pub fn to_document(&self) -> Value {
        assemble_document(&self.key, &self.attributes)
    }
}

/// The live counterpart of a [`DesiredObject`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedObject {
    /// Identity key.
    pub key: ObjectKey,
    /// Current attribute values, including server-managed fields.
    pub attributes: Attributes,
    /// When the object was read.
    pub observed_at: DateTime<Utc>,
}

impl ObservedObject {
    /// Create an observed object stamped with the current time.
    pub fn new(key: ObjectKey, attributes: Attributes) -> Self {
        Self {
            key,
            attributes,
            observed_at: Utc::now(),
        }
    }

    /// Parse a live document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document lacks identity fields.
    pub fn from_document(document: Value) -> Result<Self> {
        let (key, attributes) = split_document(document)?;
        Ok(Self::new(key, attributes))
    }

    /// Look up an attribute by dotted path.
    pub fn field(&self, path: &str) -> Option<&Value> {
        fields::get(&self.attributes, path)
    }

    /// Labels from `metadata.labels`.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.field("metadata.labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The compiled desired state of one revision for one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredSet {
    /// Revision the set was compiled from.
    pub revision: Revision,
    /// Environment selector the set was compiled for.
    pub environment: String,
    /// Objects by identity key.
    pub objects: BTreeMap<ObjectKey, DesiredObject>,
}

impl DesiredSet {
    /// Create an empty desired set.
    pub fn new(revision: Revision, environment: impl Into<String>) -> Self {
        Self {
            revision,
            environment: environment.into(),
            objects: BTreeMap::new(),
        }
    }

    /// Add an object, returning the previous object under the same key.
    pub fn insert(&mut self, object: DesiredObject) -> Option<DesiredObject> {
        self.objects.insert(object.key.clone(), object)
    }

    /// Get an object by key.
    pub fn get(&self, key: &ObjectKey) -> Option<&DesiredObject> {
        self.objects.get(key)
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Full documents in key order.
    pub fn documents(&self) -> Vec<Value> {
        self.objects.values().map(DesiredObject::to_document).collect()
    }

    /// SHA-256 over the canonical encoding of every object, in key order.
    ///
    /// Attribute maps are sorted, so equal sets always share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for object in self.objects.values() {
            hasher.update(object.key.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(Value::Object(object.attributes.clone()).to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex_encode(&hasher.finalize())
    }
}
