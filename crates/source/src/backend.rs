//! Version-control backends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use keel_core::{Error, Result, Revision};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::filter::PathFilter;

/// A fetched tree before digesting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    /// Backend revision id, when the backend has one.
    pub revision: Option<Revision>,
    /// Selected files keyed by path relative to the filter root.
    pub files: BTreeMap<String, String>,
}

/// Read-only access to a version-control endpoint.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Endpoint description for logs and errors.
    fn endpoint(&self) -> String;

    /// Fetch the tree of `branch`, restricted to files selected by `filter`.
    async fn fetch(&self, branch: &str, filter: &PathFilter) -> Result<SourceTree>;
}

/// Reads documents from a plain directory.
///
/// Hidden entries (names starting with `.`) are skipped. The backend has no
/// revision ids of its own, so snapshots use their content digest.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    /// Create a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceBackend for DirectoryBackend {
    fn endpoint(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    async fn fetch(&self, _branch: &str, filter: &PathFilter) -> Result<SourceTree> {
        let base = if filter.root().is_empty() {
            self.root.clone()
        } else {
            self.root.join(filter.root())
        };
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Err(Error::source_unavailable(
                self.endpoint(),
                format!("'{}' does not exist", base.display()),
            ));
        }

        let mut files = BTreeMap::new();
        let mut pending = vec![(base, String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| self.io_error(&dir, &e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(&dir, &e))? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    warn!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let relative = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let file_type = entry.file_type().await.map_err(|e| self.io_error(&entry.path(), &e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), relative));
                } else if file_type.is_file() && filter.matches(&relative) {
                    let contents = tokio::fs::read_to_string(entry.path())
                        .await
                        .map_err(|e| self.io_error(&entry.path(), &e))?;
                    files.insert(relative, contents);
                }
            }
        }

        debug!(endpoint = %self.endpoint(), files = files.len(), "Read directory tree");
        Ok(SourceTree {
            revision: None,
            files,
        })
    }
}

impl DirectoryBackend {
    fn io_error(&self, path: &Path, error: &std::io::Error) -> Error {
        Error::source_unavailable(self.endpoint(), format!("{}: {error}", path.display()))
    }
}

/// Reads documents from a local git clone through the `git` CLI.
///
/// With a remote configured, every fetch first runs `git fetch` and then
/// reads `<remote>/<branch>`; otherwise the local branch is read.
#[derive(Debug, Clone)]
pub struct GitCliBackend {
    repo: PathBuf,
    remote: Option<String>,
}

impl GitCliBackend {
    /// Create a backend for the clone at `repo`.
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            remote: None,
        }
    }

    /// Fetch from `remote` before reading.
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::source_unavailable(self.endpoint(), format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::source_unavailable(
                self.endpoint(),
                format!("git {} failed: {}", args.join(" "), stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl SourceBackend for GitCliBackend {
    fn endpoint(&self) -> String {
        match &self.remote {
            Some(remote) => format!("git://{} ({remote})", self.repo.display()),
            None => format!("git://{}", self.repo.display()),
        }
    }

    async fn fetch(&self, branch: &str, filter: &PathFilter) -> Result<SourceTree> {
        let reference = match &self.remote {
            Some(remote) => {
                self.git(&["fetch", "--quiet", remote, branch]).await?;
                format!("{remote}/{branch}")
            }
            None => branch.to_string(),
        };

        let spec = format!("{reference}^{{commit}}");
        let commit = String::from_utf8_lossy(&self.git(&["rev-parse", "--verify", &spec]).await?)
            .trim()
            .to_string();

        let mut args = vec!["ls-tree", "-r", "-z", "--name-only", commit.as_str()];
        if !filter.root().is_empty() {
            args.extend(["--", filter.root()]);
        }
        let listing = self.git(&args).await?;

        let mut files = BTreeMap::new();
        for raw in listing.split(|b| *b == 0).filter(|raw| !raw.is_empty()) {
            let Ok(path) = std::str::from_utf8(raw) else {
                warn!(endpoint = %self.endpoint(), "Skipping non UTF-8 path");
                continue;
            };
            let Some(relative) = filter.relative(path) else {
                continue;
            };
            if !filter.matches(relative) {
                continue;
            }
            let blob = self.git(&["show", &format!("{commit}:{path}")]).await?;
            let contents = String::from_utf8(blob).map_err(|_| {
                Error::source_unavailable(self.endpoint(), format!("'{path}' is not valid UTF-8"))
            })?;
            files.insert(relative.to_string(), contents);
        }

        debug!(
            endpoint = %self.endpoint(),
            commit = %commit,
            files = files.len(),
            "Read git tree"
        );
        Ok(SourceTree {
            revision: Some(Revision::new(commit)),
            files,
        })
    }
}

/// Scripted backend for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tree: RwLock<SourceTree>,
    failures_remaining: AtomicU32,
    fetches: AtomicU32,
}

impl InMemoryBackend {
    /// Create a backend serving `files` (paths relative to the repository root).
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self {
            tree: RwLock::new(SourceTree {
                revision: None,
                files,
            }),
            ..Self::default()
        }
    }

    /// Replace the served tree, as a new commit would.
    pub async fn commit(&self, revision: Option<Revision>, files: BTreeMap<String, String>) {
        *self.tree.write().await = SourceTree { revision, files };
    }

    /// Write or replace a single file.
    pub async fn put(&self, path: impl Into<String>, contents: impl Into<String>) {
        self.tree.write().await.files.insert(path.into(), contents.into());
    }

    /// Fail the next `count` fetches with `SourceUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of fetch attempts so far.
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceBackend for InMemoryBackend {
    fn endpoint(&self) -> String {
        "memory://".to_string()
    }

    async fn fetch(&self, _branch: &str, filter: &PathFilter) -> Result<SourceTree> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::source_unavailable(self.endpoint(), "injected failure"));
        }

        let tree = self.tree.read().await;
        let files = tree
            .files
            .iter()
            .filter_map(|(path, contents)| {
                filter
                    .relative(path)
                    .filter(|relative| filter.matches(relative))
                    .map(|relative| (relative.to_string(), contents.clone()))
            })
            .collect();
        Ok(SourceTree {
            revision: tree.revision.clone(),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_backend_reads_selected_files() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("deploy/base"))?;
        std::fs::create_dir_all(dir.path().join("deploy/.git"))?;
        std::fs::write(dir.path().join("deploy/base/app.yaml"), "kind: Deployment")?;
        std::fs::write(dir.path().join("deploy/README.md"), "docs")?;
        std::fs::write(dir.path().join("deploy/.git/config.yaml"), "hidden")?;

        let backend = DirectoryBackend::new(dir.path());
        let tree = backend.fetch("main", &PathFilter::yaml("deploy")?).await?;

        assert_eq!(tree.revision, None);
        assert_eq!(tree.files.keys().collect::<Vec<_>>(), vec!["base/app.yaml"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_backend_missing_root_is_unavailable() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let backend = DirectoryBackend::new(dir.path().join("missing"));
        let result = backend.fetch("main", &PathFilter::yaml(".")?).await;
        assert!(matches!(result, Err(Error::SourceUnavailable { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_in_memory_backend_injects_failures() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let backend = InMemoryBackend::default();
        backend.put("a.yaml", "kind: A").await;
        backend.fail_next(1);
        let filter = PathFilter::yaml(".")?;

        assert!(backend.fetch("main", &filter).await.is_err());
        let tree = backend.fetch("main", &filter).await?;
        assert_eq!(tree.files.len(), 1);
        assert_eq!(backend.fetch_count(), 2);
        Ok(())
    }
}
