//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Keel - GitOps reconciliation controller
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Drive a target environment toward the state declared in version control")]
#[command(
    long_about = "Keel polls version control, compiles overlays into a desired set per environment, \
                  diffs it against the live environment and applies the difference under a sync policy."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every configured scope and the HTTP API
    Run {
        /// Configuration file (.toml, .yaml or .yml)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the bind address from the configuration
        #[arg(long)]
        bind: Option<String>,
    },

    /// Compile a source tree offline and print the desired set
    Compile {
        /// Directory holding the documents
        #[arg(short, long)]
        source: PathBuf,

        /// Environment selector
        #[arg(short, long)]
        env: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },

    /// Compile, observe and diff one scope once; mutates nothing
    Diff {
        /// Configuration file (.toml, .yaml or .yml)
        #[arg(short, long)]
        config: PathBuf,

        /// Scope name
        #[arg(long)]
        scope: String,
    },

    /// Show scope status from a running controller
    Status {
        #[command(flatten)]
        remote: Remote,

        /// Scope name; every scope when omitted
        #[arg(long)]
        scope: Option<String>,
    },

    /// Force a sync of a scope
    Sync {
        #[command(flatten)]
        remote: Remote,

        /// Scope name
        #[arg(long)]
        scope: String,
    },

    /// Approve the sync a scope is blocked on
    Approve {
        #[command(flatten)]
        remote: Remote,

        /// Scope name
        #[arg(long)]
        scope: String,
    },

    /// Cancel the in-flight sync of a scope
    Cancel {
        #[command(flatten)]
        remote: Remote,

        /// Scope name
        #[arg(long)]
        scope: String,
    },
}

/// Address of a running controller.
#[derive(clap::Args, Debug)]
pub struct Remote {
    /// Controller API base URL
    #[arg(long, default_value = "http://127.0.0.1:7878")]
    pub server: String,
}

/// Output format of `keel compile`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_compile_command() {
        let cli = Cli::try_parse_from(["keel", "compile", "--source", "deploy", "--env", "staging", "--format", "json"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Compile { env, format: OutputFormat::Json, .. }) if env == "staging"
        ));
    }

    #[test]
    fn test_remote_commands_default_server() {
        let cli = Cli::try_parse_from(["keel", "sync", "--scope", "shop"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Sync { remote, scope }) if remote.server == "http://127.0.0.1:7878" && scope == "shop"
        ));
    }

    #[test]
    fn test_run_requires_config() {
        assert!(Cli::try_parse_from(["keel", "run"]).is_err());
    }
}
