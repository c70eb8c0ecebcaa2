//! Git-backed checkpoint and rollback collaborator.
//!
//! The recovery handler asks for a checkpoint before risky work and a
//! rollback when a rollback-and-retry strategy is selected. Checkpoints are
//! plain commits tagged by subtask id, so a human can inspect or recover
//! them with ordinary git tooling after the fact.

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository, Signature, build::CheckoutBuilder};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

const CHECKPOINT_SIGNATURE: (&str, &str) = ("conductor", "conductor@localhost");

/// Creates and restores workspace checkpoints for one project.
pub struct CheckpointManager {
    repo: Repository,
    /// Snapshot commit per subtask id, first-use wins.
    checkpoints: HashMap<String, String>,
}

impl CheckpointManager {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            repo,
            checkpoints: HashMap::new(),
        })
    }

    /// Whether a checkpoint already exists for this subtask.
    pub fn has_checkpoint(&self, subtask_id: &str) -> bool {
        self.checkpoints.contains_key(subtask_id)
    }

    /// Commit the entire working tree as a checkpoint for `subtask_id` and
    /// return the commit sha. Repeated calls for the same subtask keep the
    /// first checkpoint, so a rollback always lands before the first attempt.
    pub fn checkpoint(&mut self, subtask_id: &str) -> Result<String> {
        if let Some(sha) = self.checkpoints.get(subtask_id) {
            return Ok(sha.clone());
        }

        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let sig = Signature::now(CHECKPOINT_SIGNATURE.0, CHECKPOINT_SIGNATURE.1)?;
        let message = format!("[conductor] checkpoint before {}", subtask_id);

        // Unborn branch means this checkpoint becomes the initial commit.
        let commit_id = match self.head_commit() {
            Some(parent) => {
                self.repo
                    .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?
            }
            None => self
                .repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?,
        };

        let sha = commit_id.to_string();
        info!(subtask_id, sha = %sha, "checkpoint created");
        self.checkpoints.insert(subtask_id.to_string(), sha.clone());
        Ok(sha)
    }

    /// Hard-reset the working tree to the subtask's checkpoint.
    pub fn rollback(&self, subtask_id: &str) -> Result<()> {
        let sha = self.checkpoints.get(subtask_id).ok_or_else(|| {
            anyhow::anyhow!("No checkpoint recorded for subtask '{}'", subtask_id)
        })?;
        let oid = git2::Oid::from_str(sha)?;
        let commit = self.repo.find_commit(oid)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        self.repo
            .reset(commit.as_object(), git2::ResetType::Hard, Some(&mut checkout))
            .with_context(|| format!("Failed to roll back to checkpoint {}", sha))?;

        warn!(subtask_id, sha = %sha, "rolled back to checkpoint");
        Ok(())
    }

    /// Current branch name, `None` on a detached or unborn HEAD. Feeds the
    /// session context snapshot.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(|s| s.to_string())
    }

    /// Paths changed in the working tree since the subtask's checkpoint.
    pub fn files_changed_since(&self, subtask_id: &str) -> Result<Vec<String>> {
        let sha = match self.checkpoints.get(subtask_id) {
            Some(sha) => sha,
            None => return Ok(Vec::new()),
        };
        let oid = git2::Oid::from_str(sha)?;
        let tree = self.repo.find_commit(oid)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut files = Vec::new();
        diff.foreach(
            &mut |delta, _| {
                if !matches!(delta.status(), Delta::Unmodified)
                    && let Some(path) = delta.new_file().path()
                {
                    files.push(path.to_string_lossy().to_string());
                }
                true
            },
            None,
            None,
            None,
        )?;
        Ok(files)
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }
}
