//! Error taxonomy for Keel operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.
//! The reconciliation-specific variants map one-to-one onto how a failure
//! propagates through a cycle:
//!
//! | variant | scope of damage |
//! |---|---|
//! | `SourceUnavailable` | the current poll; retried with backoff |
//! | `CompileError` | the revision; last good desired set is kept |
//! | `ObservationError` | one object; reported as unknown |
//! | `ApplyError` | one object; recorded as failed, cycle continues |
//! | `HealthCheckTimeout` | one object; reported degraded, re-checked next cycle |

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ObjectKey;

/// Result type for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Keel operations.
#[derive(Debug, Error)]
pub enum Error {
    // Reconciliation errors
    #[error("source unavailable at '{endpoint}': {reason}")]
    SourceUnavailable { endpoint: String, reason: String },

    #[error("compile error in '{path}': {reason}")]
    CompileError { path: String, reason: String },

    #[error("failed to observe {key}: {reason}")]
    ObservationError { key: ObjectKey, reason: String },

    #[error("failed to apply {key}: {reason}")]
    ApplyError { key: ObjectKey, reason: String },

    #[error("{key} not healthy after {waited_ms}ms: {reason}")]
    HealthCheckTimeout {
        key: ObjectKey,
        waited_ms: u64,
        reason: String,
    },

    #[error("scope '{scope}' not found")]
    ScopeNotFound { scope: String },

    #[error("scope '{scope}' is not running")]
    ScopeStopped { scope: String },

    #[error("scope '{scope}' has no sync awaiting approval")]
    NothingToApprove { scope: String },

    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a source unavailable error.
    pub fn source_unavailable(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a compile error.
    pub fn compile(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CompileError {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an observation error.
    pub fn observation(key: ObjectKey, reason: impl Into<String>) -> Self {
        Self::ObservationError {
            key,
            reason: reason.into(),
        }
    }

    /// Create an apply error.
    pub fn apply(key: ObjectKey, reason: impl Into<String>) -> Self {
        Self::ApplyError {
            key,
            reason: reason.into(),
        }
    }

    /// Create a health check timeout error.
    pub fn health_check_timeout(key: ObjectKey, waited_ms: u64, reason: impl Into<String>) -> Self {
        Self::HealthCheckTimeout {
            key,
            waited_ms,
            reason: reason.into(),
        }
    }

    /// Create a scope not found error.
    pub fn scope_not_found(scope: impl Into<String>) -> Self {
        Self::ScopeNotFound { scope: scope.into() }
    }

    /// Create a scope stopped error.
    pub fn scope_stopped(scope: impl Into<String>) -> Self {
        Self::ScopeStopped { scope: scope.into() }
    }

    /// Create a nothing to approve error.
    pub fn nothing_to_approve(scope: impl Into<String>) -> Self {
        Self::NothingToApprove { scope: scope.into() }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a YAML parse error.
    pub fn yaml_parse_failed(reason: impl Into<String>) -> Self {
        Self::YamlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. }
                | Self::ObservationError { .. }
                | Self::ApplyError { .. }
                | Self::HealthCheckTimeout { .. }
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = Error::compile("overlays/prod/overlay.yaml", "unknown patch target");
        let text = err.to_string();
        assert!(text.contains("overlays/prod/overlay.yaml"));
        assert!(text.contains("unknown patch target"));
    }

    #[test]
    fn test_apply_error_names_object() {
        let err = Error::apply(ObjectKey::new("Deployment", "prod", "web"), "timeout");
        assert!(err.to_string().contains("Deployment/prod/web"));
    }

    #[test]
    fn test_compile_error_is_not_retryable() {
        assert!(!Error::compile("a.yaml", "bad").is_retryable());
        assert!(Error::source_unavailable("git", "down").is_retryable());
    }
}
