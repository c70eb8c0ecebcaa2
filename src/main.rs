use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(
    version,
    about = "Pipeline orchestrator for agent-driven development with crash-safe resume"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer every checkpoint with "continue" instead of prompting
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .conductor state directory with starter settings
    Init,
    /// Run the pipeline for the planned epic
    Run,
    /// Resume a persisted run, optionally re-running from a given epic
    Resume {
        /// Re-run from this epic number onward, even past completion
        #[arg(long)]
        from_epic: Option<u32>,
    },
    /// Answer the checkpoint of a parked work item
    Decide {
        /// Work item id
        item: String,
        /// One of: continue, pause, review, abort
        decision: String,
    },
    /// Show pipeline, session, and lock status
    Status,
    /// Inspect or discard the persisted session
    Session {
        #[command(subcommand)]
        command: Option<SessionCommands>,
    },
    /// Inspect or clean up lock records
    Locks {
        #[command(subcommand)]
        command: Option<LockCommands>,
    },
    /// Preview the assembled context for a pending work item
    Context {
        /// Item id (defaults to the next pending item)
        item: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SessionCommands {
    /// Show the session record and its resume instructions
    Show,
    /// Archive the session (renamed, never deleted)
    Discard,
}

#[derive(Subcommand, Clone)]
pub enum LockCommands {
    /// List lock records with their staleness
    List,
    /// Remove stale and corrupt lock records
    Cleanup,
}

/// Logs go to a daily-rotated file under `.conductor/logs/` once the state
/// directory exists; before `init`, they fall back to stderr.
fn init_tracing(
    project_dir: &Path,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "conductor=debug" } else { "conductor=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let log_dir = project_dir.join(".conductor").join("logs");
    if log_dir.is_dir() {
        let appender = tracing_appender::rolling::daily(&log_dir, "conductor.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = init_tracing(&project_dir, cli.verbose);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir, cli.verbose)?,
        Commands::Run => cmd::cmd_run(&cli, project_dir).await?,
        Commands::Resume { from_epic } => {
            cmd::cmd_resume(&cli, project_dir, *from_epic).await?;
        }
        Commands::Decide { item, decision } => {
            cmd::cmd_decide(&cli, project_dir, item, decision).await?;
        }
        Commands::Status => cmd::cmd_status(&project_dir, cli.verbose)?,
        Commands::Session { command } => {
            cmd::cmd_session(&project_dir, cli.verbose, command.clone())?;
        }
        Commands::Locks { command } => {
            cmd::cmd_locks(&project_dir, cli.verbose, command.clone())?;
        }
        Commands::Context { item } => {
            cmd::cmd_context(&project_dir, cli.verbose, item.as_deref())?;
        }
    }

    Ok(())
}
