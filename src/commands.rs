//! CLI command handlers.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use keel_compiler::Compiler;
use keel_core::{ControllerConfig, DesiredSet};
use keel_reconciler::{Controller, Delta, DeltaSet, DiffEngine, ObservedStateReader, controller};
use keel_source::{DirectoryBackend, PathFilter, Snapshot, SourceBackend, SourceTracker};
use keel_web::AppState;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::cli::{Commands, OutputFormat};
use crate::client::ApiClient;

/// Execute a CLI command.
pub async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config, bind } => cmd_run(&config, bind).await,
        Commands::Compile { source, env, format } => cmd_compile(&source, &env, format).await,
        Commands::Diff { config, scope } => cmd_diff(&config, &scope).await,
        Commands::Status { remote, scope } => cmd_status(&ApiClient::new(&remote.server), scope.as_deref()).await,
        Commands::Sync { remote, scope } => {
            let reply = ApiClient::new(&remote.server).sync(&scope).await?;
            println!("{}: {}", scope, reply["message"].as_str().unwrap_or("sync queued"));
            Ok(())
        }
        Commands::Approve { remote, scope } => {
            let reply = ApiClient::new(&remote.server).approve(&scope).await?;
            println!("{}: approved {}", scope, reply["fingerprint"].as_str().unwrap_or("?"));
            Ok(())
        }
        Commands::Cancel { remote, scope } => {
            let reply = ApiClient::new(&remote.server).cancel(&scope).await?;
            if reply["cancelled"].as_bool().unwrap_or(false) {
                println!("{scope}: cancellation requested");
            } else {
                println!("{scope}: no sync in flight");
            }
            Ok(())
        }
    }
}

/// Run every scope and the API until Ctrl+C.
async fn cmd_run(path: &Path, bind: Option<String>) -> Result<()> {
    let config = ControllerConfig::from_path(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let controller = Controller::start(&config).context("Failed to start scopes")?;
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;

    let (stop_api, api_stopped) = oneshot::channel::<()>();
    let state = AppState::new(controller.registry());
    let api = tokio::spawn(keel_web::serve(listener, state, async move {
        let _ = api_stopped.await;
    }));

    info!(scopes = config.scopes.len(), %bind, "Keel is running. Press Ctrl+C to stop.");
    wait_for_shutdown().await;

    let _ = stop_api.send(());
    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API task ended abnormally"),
    }
    controller.shutdown().await;
    info!("Keel stopped");
    Ok(())
}

/// Compile a directory offline and print the documents.
async fn cmd_compile(source: &Path, env: &str, format: OutputFormat) -> Result<()> {
    let backend = DirectoryBackend::new(source);
    let tree = backend
        .fetch("", &PathFilter::yaml(".")?)
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;
    let snapshot = Snapshot::new(tree.revision, tree.files);
    let desired = Compiler::new(env).compile(&snapshot)?;
    info!(objects = desired.len(), revision = %desired.revision.short(), "Compiled");
    print!("{}", render(&desired, format)?);
    Ok(())
}

fn render(desired: &DesiredSet, format: OutputFormat) -> Result<String> {
    let documents = desired.documents();
    match format {
        OutputFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(&documents)?)),
        OutputFormat::Yaml => documents
            .iter()
            .map(|document| serde_yaml::to_string(document).map(|text| format!("---\n{text}")))
            .collect::<std::result::Result<String, _>>()
            .context("Failed to render YAML"),
    }
}

/// One-shot compile, observe and diff of a scope.
async fn cmd_diff(path: &Path, name: &str) -> Result<()> {
    let config = ControllerConfig::from_path(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let scope = config.scope(name)?;

    let snapshot = SourceTracker::from_config(&scope.source)?.fetch_latest().await?;
    let desired = Compiler::new(&scope.environment)
        .with_scope(&scope.name)
        .compile(&snapshot)?;
    let cluster = controller::target(scope)?;
    let reader = ObservedStateReader::new(Arc::clone(&cluster), scope.name.clone(), &scope.limits);
    let observed = reader.observe(&desired, &BTreeSet::new(), scope.policy.prune).await;
    let deltas = DiffEngine::new(scope.diff.clone(), scope.policy.prune).diff(&desired, &observed);

    print!("{}", describe(&deltas));
    println!("revision {}: {}", desired.revision.short(), deltas.summary());
    Ok(())
}

fn describe(deltas: &DeltaSet) -> String {
    deltas
        .deltas
        .values()
        .filter_map(|delta| match delta {
            Delta::Create(object) => Some(format!("+ {}\n", object.key)),
            Delta::Update {
                desired, changed_fields, ..
            } => Some(format!(
                "~ {} ({})\n",
                desired.key,
                changed_fields.iter().cloned().collect::<Vec<_>>().join(", ")
            )),
            Delta::Delete(observed) => Some(format!("- {}\n", observed.key)),
            Delta::Unknown { key, reason } => Some(format!("? {key}: {reason}\n")),
            Delta::Unchanged(_) => None,
        })
        .collect()
}

async fn cmd_status(client: &ApiClient, scope: Option<&str>) -> Result<()> {
    let statuses = match scope {
        Some(name) => vec![client.scope(name).await?],
        None => match client.scopes().await? {
            Value::Array(statuses) => statuses,
            other => vec![other],
        },
    };
    for status in &statuses {
        println!("{}", status_line(status));
    }
    Ok(())
}

fn status_line(status: &Value) -> String {
    let field = |name: &str| status[name].as_str().unwrap_or("-").to_string();
    let mut line = format!(
        "{}\t{}\t{}\trevision={}",
        field("scope"),
        field("environment"),
        field("status"),
        status["revision"].as_str().map_or("-", |r| r.get(..12).unwrap_or(r)),
    );
    if let Some(phase) = status["phase"].as_str() {
        line.push_str(&format!("\tphase={phase}"));
    }
    if status["pending_approval"].is_string() {
        line.push_str("\tawaiting approval");
    }
    if let Some(error) = status["last_error"].as_str() {
        line.push_str(&format!("\terror={error}"));
    }
    line
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Attributes, DesiredObject, ObjectKey, Revision};
    use serde_json::json;

    fn desired() -> DesiredSet {
        let mut set = DesiredSet::new(Revision::new("abc123"), "production");
        let mut attributes = Attributes::new();
        attributes.insert("data".into(), json!({"mode": "fast"}));
        set.insert(DesiredObject::new(ObjectKey::new("ConfigMap", "shop", "flags"), attributes));
        set
    }

    #[test]
    fn test_render_yaml_separates_documents() -> Result<()> {
        let yaml = render(&desired(), OutputFormat::Yaml)?;
        assert!(yaml.starts_with("---\n"));
        assert!(yaml.contains("kind: ConfigMap"));
        Ok(())
    }

    #[test]
    fn test_render_json_is_an_array() -> Result<()> {
        let rendered: Value = serde_json::from_str(&render(&desired(), OutputFormat::Json)?)?;
        assert_eq!(rendered[0]["metadata"]["name"], "flags");
        Ok(())
    }

    #[test]
    fn test_status_line_mentions_pending_approval() {
        let line = status_line(&json!({
            "scope": "shop",
            "environment": "production",
            "status": "out_of_sync",
            "revision": "0123456789abcdef",
            "phase": "blocked",
            "pending_approval": "ff00"
        }));
        assert_eq!(
            line,
            "shop\tproduction\tout_of_sync\trevision=0123456789ab\tphase=blocked\tawaiting approval"
        );
    }
}
