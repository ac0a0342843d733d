//! # shipyard
//!
//! Command-line front end: wires settings, telemetry, the sandbox client,
//! the state store and the orchestrator together.

#![deny(unsafe_code)]

mod app_dir;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use shipyard_core::files::ProjectFiles;
use shipyard_core::policy::PathPrefixPolicy;
use shipyard_core::sandbox::EnvProvider;
use shipyard_core::DeploymentRequest;
use shipyard_engine::{DeploymentOrchestrator, OrchestratorConfig, OrchestratorDeps, TemplateSpec, TracingObserver};
use shipyard_sandbox::{HttpClientFactory, HttpSandboxConfig, ProxyCredentialMinter, ProxyEnv};
use shipyard_settings::ShipyardSettings;
use shipyard_store::{Database, DeploymentHistoryRepo};
use shipyard_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Deploy generated apps to sandbox preview instances.
#[derive(Parser, Debug)]
#[command(name = "shipyard", about = "Deploy generated apps to sandbox preview instances")]
struct Cli {
    /// Settings file (defaults to `~/.shipyard/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy a project directory and print the outcome as JSON.
    Deploy {
        dir: PathBuf,

        /// Deploy only these files (relative paths). Defaults to everything.
        #[arg(long = "file")]
        files: Vec<String>,

        /// Provision a new instance even if the current one is healthy.
        #[arg(long)]
        redeploy: bool,

        /// Clear instance logs and runtime errors after writing.
        #[arg(long)]
        clear_logs: bool,

        /// Commit message recorded with the write.
        #[arg(long)]
        message: Option<String>,

        /// Keep monitoring the instance until Ctrl-C.
        #[arg(long)]
        watch: bool,

        /// Key for persisted state (defaults to the directory name).
        #[arg(long)]
        project: Option<String>,
    },

    /// Show recent deployments for a project.
    History {
        project: String,

        #[arg(long, default_value = "10")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => shipyard_settings::load_settings_from_path(path),
        None => shipyard_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.telemetry.level),
        module_levels: Vec::new(),
        json: settings.telemetry.json,
    });

    match cli.command {
        Command::Deploy {
            dir,
            files,
            redeploy,
            clear_logs,
            message,
            watch,
            project,
        } => {
            let project = match project {
                Some(p) => p,
                None => project_key(&dir)?,
            };
            let all = app_dir::load_dir(&dir)?;
            if all.is_empty() {
                bail!("{} contains no deployable files", dir.display());
            }
            let requested = app_dir::pick(&all, &files)?;
            tracing::info!(project = %project, files = all.len(), requested = requested.len(), "project loaded");

            let deps = OrchestratorDeps::new(
                Arc::new(http_factory(&settings)?),
                Arc::new(ProjectFiles::new(all)),
            )
            .with_env(env_provider(&settings)?)
            .with_policy(Arc::new(PathPrefixPolicy::new(
                settings.template.read_only_prefixes.iter().cloned(),
            )))
            .with_template(TemplateSpec {
                name: settings.template.name.clone(),
                project_name: settings.template.project_name.clone(),
                init_command: settings.template.init_command.clone(),
            })
            .with_observer(Arc::new(TracingObserver))
            .with_metrics(telemetry.metrics())
            .with_setup_commands(settings.template.setup_commands.clone());
            let deps = match open_store(&settings)? {
                Some(db) => deps.with_store(db, project),
                None => deps,
            };
            let orchestrator = DeploymentOrchestrator::new(deps, OrchestratorConfig::default());

            let mut request = DeploymentRequest::new(requested)
                .with_redeploy(redeploy)
                .with_clear_logs(clear_logs);
            if let Some(message) = message {
                request = request.with_commit_message(message);
            }

            let Some(outcome) = orchestrator.deploy(request).await else {
                orchestrator.shutdown();
                bail!("deployment did not become ready in time");
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if watch {
                tracing::info!(instance_id = %outcome.instance_id, "watching instance, Ctrl-C to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for ctrl+c")?;
            }
            orchestrator.shutdown();
            tracing::debug!(metrics = ?telemetry.metrics().snapshot(), "final metrics");
        }

        Command::History { project, limit } => {
            let Some(db) = open_store(&settings)? else {
                bail!("persistence is disabled (store.dbPath is unset)");
            };
            let rows = DeploymentHistoryRepo::new(db)
                .list(&project, limit)
                .context("Failed to read deployment history")?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

fn project_key(dir: &Path) -> Result<String> {
    let canonical = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    Ok(canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string()))
}

fn http_factory(settings: &ShipyardSettings) -> Result<HttpClientFactory> {
    let mut config = HttpSandboxConfig::new(settings.sandbox.base_url.clone());
    config.api_key = settings.sandbox.api_key.clone().map(SecretString::from);
    config.request_timeout = Duration::from_millis(settings.sandbox.request_timeout_ms);
    HttpClientFactory::new(config).context("Failed to build sandbox client")
}

fn env_provider(settings: &ShipyardSettings) -> Result<Arc<dyn EnvProvider>> {
    let template = &settings.template;
    let env = ProxyEnv::new(template.env_vars.clone());
    if !template.requires_ai_proxy {
        return Ok(Arc::new(env));
    }
    let (Some(url), Some(secret)) = (&template.ai_proxy_url, &template.proxy_secret) else {
        bail!("template requires the AI proxy but its URL or secret is missing");
    };
    let minter = ProxyCredentialMinter::new(
        SecretString::from(secret.clone()),
        Duration::from_secs(template.proxy_token_ttl_secs),
    );
    Ok(Arc::new(env.with_proxy(url.clone(), minter)))
}

fn open_store(settings: &ShipyardSettings) -> Result<Option<Database>> {
    let Some(path) = &settings.store.db_path else {
        return Ok(None);
    };
    let path = PathBuf::from(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let db = Database::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(Some(db))
}
