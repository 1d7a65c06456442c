//! skywayd - Skyway workspace daemon
//!
//! Loads a workspace snapshot from a directory-backed object store (or
//! starts an empty workspace), feeds it events, persists the result and
//! reports what agents should run next.
//!
//! ## Commands
//!
//! - `ingest`: replay a JSON-lines event file through the event loop
//! - `pending`: print pending jobs as JSON lines
//! - `targets`: print release targets with their desired release

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skyway_core::{
    snapshot, EngineConfig, EngineError, Event, LogFormat, Workspace, WorkspaceRunner,
};
use skyway_state::FsObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "skywayd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Skyway continuous-deployment workspace daemon", long_about = None)]
struct Cli {
    /// Directory holding workspace snapshots
    #[arg(long, env = "SKYWAY_STATE_DIR", default_value = ".skyway", global = true)]
    state_dir: PathBuf,

    /// Workspace to operate on
    #[arg(
        long = "workspace",
        env = "SKYWAY_WORKSPACE_ID",
        default_value = "default",
        global = true
    )]
    workspace_id: String,

    /// Log output format: text or json
    #[arg(long, env = "SKYWAY_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Deadline for snapshot reads and writes, in seconds
    #[arg(
        long,
        env = "SKYWAY_SNAPSHOT_TIMEOUT_SECS",
        default_value_t = 30,
        global = true
    )]
    snapshot_timeout_secs: u64,

    /// Skip post-event invariant checks (and rollback)
    #[arg(long, env = "SKYWAY_SKIP_INVARIANT_CHECKS", global = true)]
    skip_invariant_checks: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a JSON-lines event file and persist the workspace
    Ingest {
        /// Event file, one JSON event per line (`#` lines are skipped)
        events: PathBuf,

        /// Abort on the first rejected event instead of skipping it
        #[arg(long)]
        strict: bool,
    },

    /// Print pending jobs as JSON lines
    Pending,

    /// Print release targets and their desired release
    Targets,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_secs),
            verify_invariants: !self.skip_invariant_checks,
            ..EngineConfig::default()
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct IngestSummary {
    applied: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    skyway_core::init_tracing(cli.log_format, level);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let storage = FsObjectStore::new(&cli.state_dir)
        .with_context(|| format!("Failed to open state dir {}", cli.state_dir.display()))?;
    let workspace = Arc::new(
        open_workspace(&cli.workspace_id, cli.engine_config(), &storage, &cancel).await?,
    );

    match &cli.command {
        Commands::Ingest { events, strict } => {
            let summary = ingest(workspace.clone(), events, *strict, cancel.clone()).await?;
            let bytes = snapshot::save(&workspace, &storage, &cancel)
                .await
                .context("Failed to save workspace snapshot")?;
            info!(
                applied = summary.applied,
                rejected = summary.rejected,
                snapshot_bytes = bytes,
                "ingest complete"
            );
            print_pending(&workspace)
        }
        Commands::Pending => print_pending(&workspace),
        Commands::Targets => print_targets(&workspace),
    }
}

async fn open_workspace(
    workspace_id: &str,
    config: EngineConfig,
    storage: &FsObjectStore,
    cancel: &CancellationToken,
) -> Result<Workspace> {
    let workspace = Workspace::new(workspace_id, config);
    match snapshot::load(&workspace, storage, cancel).await {
        Ok(targets) => info!(workspace_id, targets, "workspace loaded"),
        Err(EngineError::SnapshotNotFound { path }) => {
            info!(workspace_id, %path, "no snapshot, starting empty workspace")
        }
        Err(err) => return Err(err).context("Failed to load workspace snapshot"),
    }
    Ok(workspace)
}

async fn ingest(
    workspace: Arc<Workspace>,
    events: &Path,
    strict: bool,
    cancel: CancellationToken,
) -> Result<IngestSummary> {
    let text = tokio::fs::read_to_string(events)
        .await
        .with_context(|| format!("Failed to read {}", events.display()))?;

    let (runner, sender) = WorkspaceRunner::new(workspace, cancel);
    let handle = tokio::spawn(runner.run());

    let mut summary = IngestSummary::default();
    let mut failure = None;
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let location = format!("{}:{}", events.display(), index + 1);
        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                failure =
                    Some(anyhow::Error::new(err).context(format!("{location}: malformed event")));
                break;
            }
        };
        match sender.push(event).await {
            Ok(_) => summary.applied += 1,
            Err(err @ EngineError::Validation(_)) if !strict => {
                warn!(%location, error = %err, "event rejected");
                summary.rejected += 1;
            }
            Err(err) => {
                failure =
                    Some(anyhow::Error::new(err).context(format!("{location}: event failed")));
                break;
            }
        }
    }

    drop(sender);
    handle.await.context("Workspace runner panicked")?;
    match failure {
        Some(err) => Err(err),
        None => Ok(summary),
    }
}

fn print_pending(workspace: &Workspace) -> Result<()> {
    for job in workspace.pending_jobs() {
        println!("{}", serde_json::to_string(&job)?);
    }
    Ok(())
}

fn print_targets(workspace: &Workspace) -> Result<()> {
    for target in workspace.release_targets() {
        let desired = workspace.desired_release(&target)?;
        let line = serde_json::json!({
            "release_target": target,
            "desired_version": desired.as_ref().map(|r| r.version.tag.clone()),
            "desired_release": desired.map(|r| r.id),
        });
        println!("{line}");
    }
    Ok(())
}
