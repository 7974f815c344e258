//! modci - dependency-aware build orchestrator CLI
//!
//! ## Commands
//!
//! - `run`: build a manifest's task, its dependencies first
//! - `signs`: list the commits recorded for a task's dependencies
//! - `config`: print the effective configuration

mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modci_core::{
    BuildOutcome, CiConfig, Collaborators, DependencyBuildCoordinator, GitCliSynchronizer,
    PipelineOrchestrator, PipelineReport, ProcessRunner, ReleaseHook,
};
use modci_state::fakes::MemoryTaskSignStore;
use modci_state::{SurrealTaskSignStore, TaskId, TaskSignStore};
use tracing::{info, Level};

use crate::manifest::Manifest;

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "modci.toml";

#[derive(Parser)]
#[command(name = "modci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware build pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "MODCI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a task: every dependency, then the primary project
    Run {
        /// Manifest declaring the task, projects, dependency edges and overrides
        #[arg(short, long)]
        manifest: PathBuf,

        /// Restore recorded commits instead of building branch heads
        #[arg(long)]
        rollback: bool,

        /// Keep task signs in memory instead of SurrealDB
        #[arg(long)]
        ephemeral: bool,

        /// Write the pipeline report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List the dependency commits recorded for a task
    Signs {
        /// Task history id
        #[arg(short, long)]
        task: i64,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    modci_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            manifest,
            rollback,
            ephemeral,
            report,
        } => cmd_run(&config, &manifest, rollback, ephemeral, report.as_deref()).await,
        Commands::Signs { task } => cmd_signs(TaskId(task)).await,
        Commands::Config => cmd_config(&config),
    }
}

/// File (explicit, or `modci.toml` if present), then environment, then an
/// absolute workspace root, then validation.
fn load_config(path: Option<&Path>) -> Result<CiConfig> {
    let mut config = match path {
        Some(path) => CiConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            CiConfig::load(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("Failed to load {}", DEFAULT_CONFIG_FILE))?
        }
        None => CiConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid MODCI_* environment override")?;
    config
        .resolve_workspace_root()
        .context("Failed to resolve the workspace root")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn open_sign_store(ephemeral: bool) -> Result<Arc<dyn TaskSignStore>> {
    if ephemeral {
        info!("task signs kept in memory");
        return Ok(Arc::new(MemoryTaskSignStore::new()));
    }
    let store = SurrealTaskSignStore::from_env()
        .await
        .context("Failed to connect to the task sign database")?;
    Ok(Arc::new(store))
}

/// Build the manifest's task
async fn cmd_run(
    config: &CiConfig,
    manifest_path: &Path,
    rollback: bool,
    ephemeral: bool,
    report_path: Option<&Path>,
) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let stores = manifest.stores();

    let signs = open_sign_store(ephemeral).await?;
    let seeded = manifest.seed_signs(signs.as_ref()).await?;
    if seeded > 0 {
        info!(seeded, "recorded signs from manifest");
    }

    let mutex = modci_core::mutex::connect(&config.lock)
        .await
        .context("Failed to set up the build lock backend")?;
    let hook = ReleaseHook::from_config(&config.release)
        .context("Failed to set up the release notifier")?;

    let coordinator = Arc::new(DependencyBuildCoordinator::new(
        config,
        Collaborators {
            projects: Arc::new(stores.projects),
            signs,
            mutex,
            source: Arc::new(GitCliSynchronizer::default()),
            runner: Arc::new(ProcessRunner::new(config.build.shell.clone())),
        },
    ));
    let orchestrator = PipelineOrchestrator::new(
        coordinator,
        Arc::new(stores.resolver),
        Arc::new(stores.overrides),
    )
    .with_hook(Arc::new(hook))
    .with_parallel_dependencies(config.build.parallel_dependencies);

    let log_file = config.layout().job_log(manifest.task.id);
    let report = orchestrator
        .run_pipeline(&manifest.task, rollback)
        .await
        .with_context(|| {
            format!(
                "Pipeline for task {} failed (build log: {})",
                manifest.task.id,
                log_file.display()
            )
        })?;

    print_report(&report);
    println!("Build log: {}", log_file.display());

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("Report: {}", path.display());
    }

    Ok(())
}

fn print_report(report: &PipelineReport) {
    let mode = if report.rollback { "rollback" } else { "build" };
    println!(
        "Task {} {} finished in {}ms",
        report.task_id, mode, report.duration_ms
    );
    for module in &report.modules {
        let role = if module.dependency_id.is_some() {
            "dependency"
        } else {
            "primary"
        };
        let commit = module.commit.as_deref().unwrap_or("-");
        println!(
            "  {:<10} project {:<6} {:<20} {:<12} {}",
            role,
            module.project_id,
            module.branch,
            short_sha(commit),
            outcome_label(module.outcome)
        );
    }
}

fn outcome_label(outcome: BuildOutcome) -> &'static str {
    match outcome {
        BuildOutcome::Built => "built",
        BuildOutcome::SkippedAfterWait => "skipped (built by another run)",
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..12.min(sha.len())]
}

/// List recorded dependency commits
async fn cmd_signs(task_id: TaskId) -> Result<()> {
    let store = SurrealTaskSignStore::from_env()
        .await
        .context("Failed to connect to the task sign database")?;
    let signs = store
        .list_by_task(task_id)
        .await
        .context("Failed to list task signs")?;

    if signs.is_empty() {
        println!("No signs recorded for task {}", task_id);
        return Ok(());
    }

    for sign in signs {
        println!(
            "dependency {:<6} {}  {}",
            sign.dependency_id,
            sign.sha_git,
            sign.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &CiConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
