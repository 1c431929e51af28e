//! Point-in-time view of a filtered document tree.

use std::collections::BTreeMap;

use keel_core::Revision;
use keel_core::types::sha256_hex;

/// A revision resolved to its filtered file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Revision identifier (commit id, or the digest when the backend has none).
    pub revision: Revision,
    /// File contents keyed by path relative to the tracked sub-path.
    pub files: BTreeMap<String, String>,
    /// SHA-256 over every `(path, contents)` pair in path order.
    pub digest: String,
}

impl Snapshot {
    /// Build a snapshot, computing the content digest.
    ///
    /// When `revision` is `None` the digest doubles as the revision.
    pub fn new(revision: Option<Revision>, files: BTreeMap<String, String>) -> Self {
        let digest = content_digest(&files);
        let revision = revision.unwrap_or_else(|| Revision::new(digest.clone()));
        Self {
            revision,
            files,
            digest,
        }
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the snapshot holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn content_digest(files: &BTreeMap<String, String>) -> String {
    let mut buffer = Vec::new();
    for (path, contents) in files {
        buffer.extend_from_slice(path.as_bytes());
        buffer.push(0);
        buffer.extend_from_slice(&(contents.len() as u64).to_le_bytes());
        buffer.extend_from_slice(contents.as_bytes());
    }
    sha256_hex(&buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect()
    }

    #[test]
    fn test_digest_is_revision_when_backend_has_none() {
        let snapshot = Snapshot::new(None, files(&[("a.yaml", "kind: A")]));
        assert_eq!(snapshot.revision.as_str(), snapshot.digest);
    }

    #[test]
    fn test_digest_changes_with_content_not_revision() {
        let a = Snapshot::new(Some(Revision::new("c1")), files(&[("a.yaml", "x")]));
        let b = Snapshot::new(Some(Revision::new("c2")), files(&[("a.yaml", "x")]));
        let c = Snapshot::new(Some(Revision::new("c3")), files(&[("a.yaml", "y")]));
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_digest_distinguishes_path_boundaries() {
        let a = Snapshot::new(None, files(&[("ab", "c")]));
        let b = Snapshot::new(None, files(&[("a", "bc")]));
        assert_ne!(a.digest, b.digest);
    }
}
