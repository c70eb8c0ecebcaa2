use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Name of the per-project state directory.
pub const STATE_DIR_NAME: &str = ".conductor";

/// Runtime configuration for Conductor.
///
/// Resolves the on-disk layout of the `.conductor/` state directory for one
/// project and provides convenient access to every path the orchestrator
/// persists to. Settings (retry bounds, budgets, feature flags) live in
/// [`crate::conductor_config::ConductorToml`]; this struct is paths only.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub session_dir: PathBuf,
    pub session_file: PathBuf,
    /// v1 layout, pre-dating the `session/` subdirectory. Read for migration
    /// only; never written.
    pub legacy_session_file: PathBuf,
    pub escalations_dir: PathBuf,
    pub recovery_dir: PathBuf,
    pub recovery_log: PathBuf,
    pub status_file: PathBuf,
    pub log_dir: PathBuf,
    pub settings_file: PathBuf,
    pub verbose: bool,
}

impl Config {
    /// Create a new Config rooted at `project_dir`.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let state_dir = project_dir.join(STATE_DIR_NAME);
        let session_dir = state_dir.join("session");
        let recovery_dir = state_dir.join("recovery");

        Ok(Self {
            locks_dir: state_dir.join("locks"),
            runs_dir: state_dir.join("runs"),
            session_file: session_dir.join("state.json"),
            legacy_session_file: state_dir.join("session-state.json"),
            escalations_dir: state_dir.join("escalations"),
            recovery_log: recovery_dir.join("attempts.jsonl"),
            status_file: state_dir.join("status.json"),
            log_dir: state_dir.join("logs"),
            settings_file: state_dir.join("conductor.toml"),
            session_dir,
            recovery_dir,
            state_dir,
            project_dir,
            verbose,
        })
    }

    /// Create every directory the orchestrator writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.locks_dir).context("Failed to create locks directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.session_dir)
            .context("Failed to create session directory")?;
        std::fs::create_dir_all(&self.escalations_dir)
            .context("Failed to create escalations directory")?;
        std::fs::create_dir_all(&self.recovery_dir)
            .context("Failed to create recovery directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Path of the persisted run record for one work item.
    pub fn run_record_path(&self, work_item_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", work_item_id))
    }

    /// Path of the lock file for one resource.
    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", resource))
    }
}

/// Check whether a project has a conductor state directory.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(STATE_DIR_NAME).is_dir()
}
