//! Path filter selecting document files below a repository sub-path.

use glob::{MatchOptions, Pattern};
use keel_core::{Error, Result};

/// Selects files below `root` whose relative path matches an include pattern.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: String,
    patterns: Vec<Pattern>,
}

impl PathFilter {
    /// Create a filter for `root` (`.` or empty for the repository root).
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a pattern is not a valid glob or no
    /// pattern is given.
    pub fn new(root: &str, include: &[String]) -> Result<Self> {
        if include.is_empty() {
            return Err(Error::invalid_config("source include patterns must not be empty"));
        }
        let patterns = include
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| Error::invalid_config(format!("invalid include pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: normalize_root(root),
            patterns,
        })
    }

    /// Filter accepting every YAML document below `root`.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in patterns; the signature mirrors [`Self::new`].
    pub fn yaml(root: &str) -> Result<Self> {
        Self::new(root, &["**/*.yaml".to_string(), "**/*.yml".to_string()])
    }

    /// Normalized root ("" for the repository root).
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Whether a path relative to the root is selected.
    pub fn matches(&self, relative: &str) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.patterns.iter().any(|p| p.matches_with(relative, options))
    }

    /// Strip the root from a repository-relative path.
    ///
    /// Returns `None` when the path lies outside the root.
    pub fn relative<'a>(&self, repo_path: &'a str) -> Option<&'a str> {
        if self.root.is_empty() {
            return Some(repo_path);
        }
        repo_path
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

fn normalize_root(root: &str) -> String {
    root.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_filter_matches_nested_and_top_level() {
        let filter = PathFilter::yaml(".").ok();
        assert!(filter.as_ref().is_some_and(|f| f.matches("base/deploy.yaml")));
        assert!(filter.as_ref().is_some_and(|f| f.matches("overlay.yml")));
        assert!(filter.as_ref().is_some_and(|f| !f.matches("README.md")));
    }

    #[test]
    fn test_relative_strips_root() {
        let filter = PathFilter::yaml("./deploy/").ok();
        assert_eq!(filter.as_ref().map(PathFilter::root), Some("deploy"));
        assert_eq!(
            filter.as_ref().and_then(|f| f.relative("deploy/base/a.yaml")),
            Some("base/a.yaml")
        );
        assert_eq!(filter.as_ref().and_then(|f| f.relative("deployments/a.yaml")), None);
    }

    #[test]
    fn test_rejects_invalid_pattern() {
        assert!(PathFilter::new(".", &["[".to_string()]).is_err());
        assert!(PathFilter::new(".", &[]).is_err());
    }
}
