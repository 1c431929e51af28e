//! Controller configuration.
//!
//! A controller manages one or more scopes. Each scope pairs a source
//! (where desired state is read from) with a target (where it is applied),
//! plus the policy, diff options and limits that govern its loop.
//!
//! Configuration is read from TOML or YAML, chosen by file extension:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7878"
//!
//! [[scopes]]
//! name = "production"
//! environment = "production"
//!
//! [scopes.source]
//! kind = "git"
//! location = "./deploy-repo"
//! branch = "main"
//!
//! [scopes.target]
//! kind = "directory"
//! location = "./state/production"
//!
//! [scopes.policy]
//! prune = true
//! self_heal = true
//! ```

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::policy::{DiffOptions, Limits, SyncPolicy};

const DEFAULT_BIND: &str = "127.0.0.1:7878";
const DEFAULT_BRANCH: &str = "main";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// HTTP operational surface.
    #[serde(default)]
    pub server: ServerConfig,
    /// Managed scopes.
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (e.g. "127.0.0.1:7878").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// One managed scope: a source, a target and the policy between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Unique scope name; also the value of the tracking label.
    pub name: String,
    /// Environment selector handed to the compiler.
    pub environment: String,
    /// Where desired state comes from.
    pub source: SourceConfig,
    /// Where desired state is applied.
    #[serde(default)]
    pub target: TargetConfig,
    /// Sync policy.
    #[serde(default)]
    pub policy: SyncPolicy,
    /// Diff normalization options.
    #[serde(default)]
    pub diff: DiffOptions,
    /// Concurrency and timeouts.
    #[serde(default)]
    pub limits: Limits,
    /// Number of sync results kept per scope.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

const fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// Source backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A plain directory (e.g. a checked-out working tree).
    #[default]
    Directory,
    /// A local git clone read through the `git` CLI.
    Git,
}

/// Version-control endpoint of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Backend kind.
    #[serde(default)]
    pub kind: SourceKind,
    /// Repository or directory location.
    pub location: PathBuf,
    /// Branch to track (git only).
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Remote fetched before every poll (git only); the local branch is read when unset.
    #[serde(default)]
    pub remote: Option<String>,
    /// Sub-path of the repository holding the documents.
    #[serde(default = "default_path")]
    pub path: String,
    /// Glob patterns selecting document files, relative to `path`.
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    /// Interval between polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Backoff applied when the endpoint is unreachable.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_path() -> String {
    ".".to_string()
}

fn default_include() -> Vec<String> {
    vec!["**/*.yaml".to_string(), "**/*.yml".to_string()]
}

const fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl SourceConfig {
    /// Poll interval.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Retry settings for source fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first failure.
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay between retries (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 - 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter_factor: 0.1,
        }
    }
}

/// Target environment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Process-local cluster, lost on exit.
    #[default]
    Memory,
    /// Objects persisted as JSON files under a directory.
    Directory,
}

/// Target environment of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target kind.
    #[serde(default)]
    pub kind: TargetKind,
    /// Location for directory targets.
    #[serde(default)]
    pub location: Option<PathBuf>,
}

impl ControllerConfig {
    /// Load configuration from a `.toml`, `.yaml` or `.yml` file.
    ///
    /// Relative source and target locations are resolved against the
    /// directory containing the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, has an unsupported
    /// extension, fails to parse, or fails validation.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        let mut config = match path.extension().and_then(OsStr::to_str) {
            Some("toml") => Self::from_toml_str(&text)?,
            Some("yaml" | "yml") => Self::from_yaml_str(&text)?,
            other => {
                return Err(Error::invalid_config(format!(
                    "unsupported config format '{}' (expected .toml, .yaml or .yml)",
                    other.unwrap_or("")
                )));
            }
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!(path = %path.display(), scopes = config.scopes.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on parse or validation failure.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on parse or validation failure.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::yaml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a scope by name.
    ///
    /// # Errors
    ///
    /// Returns `ScopeNotFound` if no scope has that name.
    pub fn scope(&self, name: &str) -> Result<&ScopeConfig> {
        self.scopes
            .iter()
            .find(|scope| scope.name == name)
            .ok_or_else(|| Error::ScopeNotFound {
                scope: name.to_string(),
            })
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.scopes.is_empty() {
            return Err(Error::invalid_config("no scopes configured"));
        }
        let mut seen = BTreeSet::new();
        for scope in &self.scopes {
            scope.validate()?;
            if !seen.insert(scope.name.as_str()) {
                return Err(Error::invalid_config(format!("duplicate scope '{}'", scope.name)));
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for scope in &mut self.scopes {
            if scope.source.location.is_relative() {
                scope.source.location = base.join(&scope.source.location);
            }
            if let Some(location) = scope.target.location.as_mut() {
                if location.is_relative() {
                    *location = base.join(&*location);
                }
            }
        }
    }
}

impl ScopeConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::invalid_config(format!("scope '{}': {reason}", self.name));

        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("scope name must not be empty"));
        }
        if self.environment.trim().is_empty() {
            return Err(invalid("environment must not be empty"));
        }
        if self.source.poll_interval_secs == 0 {
            return Err(invalid("source.poll_interval_secs must be greater than zero"));
        }
        if self.policy.drift_interval_secs == 0 {
            return Err(invalid("policy.drift_interval_secs must be greater than zero"));
        }
        if self.limits.observe_concurrency == 0 || self.limits.apply_concurrency == 0 {
            return Err(invalid("concurrency limits must be greater than zero"));
        }
        if self.limits.call_timeout_ms == 0 {
            return Err(invalid("limits.call_timeout_ms must be greater than zero"));
        }
        if self.history_limit == 0 {
            return Err(invalid("history_limit must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.source.retry.jitter_factor) {
            return Err(invalid("source.retry.jitter_factor must be within 0.0..=1.0"));
        }
        if self.target.kind == TargetKind::Directory && self.target.location.is_none() {
            return Err(invalid("directory targets need a location"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::HealthCondition;

    const TOML: &str = r#"
[server]
bind = "0.0.0.0:9000"

[[scopes]]
name = "production"
environment = "production"

[scopes.source]
kind = "git"
location = "repo"

[scopes.target]
kind = "directory"
location = "state/prod"

[scopes.policy]
prune = true
self_heal = true
manual_approval_required = true
approval_namespaces = ["payments"]

[[scopes.policy.health_checks]]
kind = "Deployment"
timeout_secs = 5
condition = { type = "fields_match", path = "status.readyReplicas", equals = "spec.replicas" }
"#;

    #[test]
    fn test_parses_toml_with_defaults() {
        let config = ControllerConfig::from_toml_str(TOML);
        assert!(config.is_ok(), "{config:?}");
        let Some(config) = config.ok() else { return };

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        let scope = &config.scopes[0];
        assert_eq!(scope.source.kind, SourceKind::Git);
        assert_eq!(scope.source.branch, "main");
        assert_eq!(scope.source.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert!(scope.policy.automated);
        assert!(scope.policy.requires_approval("payments"));
        assert!(!scope.policy.requires_approval("web"));
        assert_eq!(scope.history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(matches!(
            scope.policy.health_check_for("Deployment").map(|c| &c.condition),
            Some(HealthCondition::FieldsMatch { .. })
        ));
    }

    #[test]
    fn test_parses_yaml() {
        let yaml = "scopes:\n  - name: staging\n    environment: staging\n    source:\n      location: ./deploy\n";
        let config = ControllerConfig::from_yaml_str(yaml);
        assert!(config.is_ok());
        assert_eq!(
            config.ok().map(|c| c.scopes[0].target.kind),
            Some(TargetKind::Memory)
        );
    }

    #[test]
    fn test_rejects_duplicate_scope_names() {
        let yaml = "scopes:\n  - {name: a, environment: a, source: {location: x}}\n  - {name: a, environment: b, source: {location: y}}\n";
        let result = ControllerConfig::from_yaml_str(yaml);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_directory_target_without_location() {
        let yaml = "scopes:\n  - {name: a, environment: a, source: {location: x}, target: {kind: directory}}\n";
        assert!(ControllerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_empty_config() {
        assert!(ControllerConfig::from_yaml_str("scopes: []\n").is_err());
    }

    #[test]
    fn test_from_path_resolves_relative_locations() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, TOML)?;

        let config = ControllerConfig::from_path(&path)?;
        let scope = config.scope("production")?;
        assert_eq!(scope.source.location, dir.path().join("repo"));
        assert_eq!(scope.target.location, Some(dir.path().join("state/prod")));
        Ok(())
    }

    #[test]
    fn test_from_path_rejects_unknown_extension() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keel.ini");
        std::fs::write(&path, "x=1")?;
        assert!(matches!(
            ControllerConfig::from_path(&path),
            Err(Error::InvalidConfig { .. })
        ));
        Ok(())
    }
}
