//! Parsing of declarative documents.

use std::collections::BTreeMap;

use keel_core::{check_segment, fields, values_equal, Attributes, DesiredObject, Error, ObjectKey, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::overlay::{Overlay, OVERLAY_KIND};

/// One parsed YAML document.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// A concrete resource.
    Resource(Resource),
    /// A composition of a base directory with patches.
    Overlay(Overlay),
}

/// A resource document whose namespace may still be supplied by an overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// File the document was read from.
    pub origin: String,
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Namespace, if the document declares one.
    pub namespace: Option<String>,
    /// Everything except `kind`, `metadata.name` and `metadata.namespace`.
    pub attributes: Attributes,
    /// Locations already written by an enclosing overlay, with the value
    /// and the overlay file that wrote it.
    pub overrides: BTreeMap<String, (Value, String)>,
}

impl Resource {
    /// Build a resource from a parsed document.
    ///
    /// # Errors
    ///
    /// Returns `CompileError` when an identity field is missing or not a
    /// non-empty string.
    pub fn from_value(origin: &str, value: Value) -> Result<Self> {
        let Value::Object(mut attributes) = value else {
            return Err(Error::compile(origin, "document is not a mapping"));
        };
        let kind = take_identity(origin, &mut attributes, "kind")?
            .ok_or_else(|| Error::compile(origin, "missing required field 'kind'"))?;
        let name = take_identity(origin, &mut attributes, "metadata.name")?
            .ok_or_else(|| Error::compile(origin, format!("{kind} is missing 'metadata.name'")))?;
        let namespace = take_identity(origin, &mut attributes, "metadata.namespace")?;

        let metadata_empty = attributes
            .get("metadata")
            .and_then(Value::as_object)
            .is_some_and(serde_json::Map::is_empty);
        if metadata_empty {
            attributes.remove("metadata");
        }

        Ok(Self {
            origin: origin.to_string(),
            kind,
            name,
            namespace,
            attributes,
            overrides: BTreeMap::new(),
        })
    }

    /// Whether this resource is addressed by `kind` and `name`.
    pub fn is(&self, kind: &str, name: &str) -> bool {
        self.kind == kind && self.name == name
    }

    /// Short `kind/name` label for error messages.
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Record that the overlay in `file` writes `value` at `location`.
    ///
    /// # Errors
    ///
    /// Returns `CompileError` when another overlay in the chain already
    /// wrote a different value at the same location.
    pub fn record_override(&mut self, file: &str, location: &str, value: &Value) -> Result<()> {
        let disagreeing = self
            .overrides
            .get(location)
            .filter(|(earlier, _)| !values_equal(earlier, value));
        if let Some((earlier, by)) = disagreeing {
            return Err(Error::compile(
                file,
                format!(
                    "{} field '{location}' is set to {value} here but to {earlier} by '{by}'",
                    self.label()
                ),
            ));
        }
        self.overrides
            .insert(location.to_string(), (value.clone(), file.to_string()));
        Ok(())
    }

    /// Resolve into a concrete object.
    ///
    /// # Errors
    ///
    /// Returns `CompileError` if no namespace was declared or supplied.
    pub fn into_object(self) -> Result<DesiredObject> {
        let Some(namespace) = self.namespace else {
            return Err(Error::compile(
                &self.origin,
                format!("{}/{} has no namespace and no overlay supplies one", self.kind, self.name),
            ));
        };
        let key = ObjectKey::new(self.kind, namespace, self.name);
        key.validate()
            .map_err(|reason| Error::compile(&self.origin, format!("{key}: {reason}")))?;
        Ok(DesiredObject::new(key, self.attributes))
    }
}

fn take_identity(origin: &str, attributes: &mut Attributes, path: &str) -> Result<Option<String>> {
    match fields::remove(attributes, path) {
        None => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => match check_segment(&s) {
            Ok(()) => Ok(Some(s)),
            Err(reason) => Err(Error::compile(origin, format!("'{path}': {reason}"))),
        },
        Some(_) => Err(Error::compile(origin, format!("'{path}' must be a non-empty string"))),
    }
}

/// Parse every document in a YAML file.
///
/// Empty documents (a bare `---`) are skipped.
///
/// # Errors
///
/// Returns `CompileError` for YAML syntax errors and malformed documents.
pub fn parse_file(path: &str, contents: &str) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for (index, raw) in serde_yaml::Deserializer::from_str(contents).enumerate() {
        let value = Value::deserialize(raw)
            .map_err(|e| Error::compile(path, format!("document {}: {e}", index + 1)))?;
        if value.is_null() {
            continue;
        }
        documents.push(parse_document(path, value)?);
    }
    Ok(documents)
}

fn parse_document(path: &str, value: Value) -> Result<Document> {
    let is_overlay = value.get("kind").and_then(Value::as_str) == Some(OVERLAY_KIND);
    if is_overlay {
        let overlay: Overlay = serde_json::from_value(value)
            .map_err(|e| Error::compile(path, format!("invalid overlay: {e}")))?;
        overlay.validate(path)?;
        Ok(Document::Overlay(overlay))
    } else {
        Resource::from_value(path, value).map(Document::Resource)
    }
}
