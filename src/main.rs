use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cadence::config::CadenceToml;
use cadence::context::ExecutionContext;
use cadence::errors::RunError;
use cadence::handlers::{ApprovalSource, PhaseHandler, StaticApprovals};
use cadence::orchestrator::{Orchestrator, RunMode};
use cadence::reclaim::{find_orphans, reclaim};
use cadence::store::{STORE_DIR_NAME, StateStore};
use cadence::synclog::RecordFilter;
use cadence::ui;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Delivery pipeline orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory to resolve the execution context from (defaults to cwd)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new feature at the specify phase
    New {
        /// What the feature is about
        description: Vec<String>,
    },
    /// Advance the pipeline from the derived current phase
    Run,
    /// Cut a release from the current branch (forces the release phase)
    Release,
    /// Resume a run paused at a manual gate
    Continue,
    /// Show the derived phase and recommended action
    Status {
        /// Emit machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show synchronization log history for this checkout
    History {
        /// Include records from every checkout sharing the log
        #[arg(long)]
        all: bool,
    },
    /// List state stores left behind by removed checkouts
    Orphans,
    /// Delete an orphaned state store
    Reclaim {
        /// Path to the state directory to delete
        path: PathBuf,
        /// Skip the interactive confirmation
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cwd = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };
    let ctx = ExecutionContext::resolve(&cwd)?;

    match &cli.command {
        Commands::New { description } => cmd_run(&ctx, RunMode::New {
            description: description.join(" "),
        }),
        Commands::Run => cmd_run(&ctx, RunMode::Default),
        Commands::Release => cmd_run(&ctx, RunMode::Release),
        Commands::Continue => cmd_run(&ctx, RunMode::Continue),
        Commands::Status { json } => cmd_status(&ctx, *json),
        Commands::History { all } => cmd_history(&ctx, *all),
        Commands::Orphans => cmd_orphans(&ctx),
        Commands::Reclaim { path, force } => cmd_reclaim(&ctx, path, *force),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "cadence=debug" } else { "cadence=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run modes that execute phases. Exit 0 on success or clean pause,
/// non-zero on handler failure.
fn cmd_run(ctx: &ExecutionContext, mode: RunMode) -> Result<()> {
    let config = CadenceToml::load_or_default(&ctx.root)?;
    let rules = config.branch_rules()?;

    let Some(handler) = config.handler() else {
        bail!(
            "no pipeline.handler_cmd configured in cadence.toml; \
             add one before running phases"
        );
    };
    let approvals: Box<dyn ApprovalSource> = match config.approvals() {
        Some(cmd) => Box::new(cmd),
        None => Box::new(StaticApprovals::default()),
    };

    let (store, _degraded) = StateStore::locate_or_isolated(ctx)?;
    let log = store.open_log()?;
    let mut orchestrator = Orchestrator::new(ctx, log, rules, &handler, approvals.as_ref());

    let report = match orchestrator.run(mode) {
        Ok(report) => report,
        Err(RunError::Validation(msg)) => bail!("invalid request: {msg}"),
        Err(err) => return Err(err.into()),
    };

    ui::print_report(&report);
    if report.failed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_status(ctx: &ExecutionContext, json: bool) -> Result<()> {
    let config = CadenceToml::load_or_default(&ctx.root)?;
    let rules = config.branch_rules()?;
    let approvals: Box<dyn ApprovalSource> = match config.approvals() {
        Some(cmd) => Box::new(cmd),
        None => Box::new(StaticApprovals::default()),
    };

    let (store, _degraded) = StateStore::locate_or_isolated(ctx)?;
    let log = store.open_log()?;
    // Status never executes anything; the handler is irrelevant here.
    let handler = NoopHandler;
    let orchestrator = Orchestrator::new(ctx, log, rules, &handler, approvals.as_ref());

    let status = orchestrator.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        ui::print_status(&status);
    }
    Ok(())
}

fn cmd_history(ctx: &ExecutionContext, all: bool) -> Result<()> {
    let (store, _degraded) = StateStore::locate_or_isolated(ctx)?;
    let log = store.open_log()?;
    let filter = if all {
        RecordFilter::All
    } else {
        RecordFilter::Context {
            id: &ctx.context_id,
            include_legacy: !ctx.is_secondary,
        }
    };
    let records = log.latest_for(filter)?;
    ui::print_history(&records);
    Ok(())
}

fn cmd_orphans(ctx: &ExecutionContext) -> Result<()> {
    let (store, _degraded) = StateStore::locate_or_isolated(ctx)?;
    let log = store.open_log()?;
    let orphans = find_orphans(ctx, &log)?;
    ui::print_orphans(&orphans);
    Ok(())
}

fn cmd_reclaim(ctx: &ExecutionContext, path: &PathBuf, force: bool) -> Result<()> {
    let (store, _degraded) = StateStore::locate_or_isolated(ctx)?;
    let log = store.open_log()?;
    let orphans = find_orphans(ctx, &log)?;

    let target = path.canonicalize().unwrap_or_else(|_| path.clone());
    let Some(candidate) = orphans.iter().find(|o| {
        o.store_path
            .canonicalize()
            .map(|p| p == target)
            .unwrap_or(false)
    }) else {
        bail!(
            "{} is not an orphaned {} directory (checkout still live, or unknown to the log)",
            path.display(),
            STORE_DIR_NAME
        );
    };

    let confirmed = force || ui::confirm_reclaim(candidate)?;
    if !confirmed {
        println!("aborted");
        return Ok(());
    }
    reclaim(candidate, true)?;
    println!("reclaimed {}", candidate.store_path.display());
    Ok(())
}

/// Placeholder handler for query-only commands.
struct NoopHandler;

impl PhaseHandler for NoopHandler {
    fn execute(
        &self,
        _ctx: &ExecutionContext,
        phase: &cadence::pipeline::PhaseDef,
    ) -> Result<cadence::handlers::HandlerOutcome> {
        bail!("phase {} cannot execute without a configured handler", phase.name)
    }
}
