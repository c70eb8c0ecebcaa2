//! Failure classification and recovery-strategy selection.
//!
//! Every epic failure lands in [`RecoveryHandler::handle_failure`], which
//! records the attempt, consults the stuck detector, and selects exactly one
//! strategy. Attempt records are append-only and durably mirrored to
//! `.conductor/recovery/attempts.jsonl`; escalations additionally produce a
//! standalone report for a human.

pub mod classifier;
pub mod escalation;
pub mod stuck;

pub use classifier::ErrorClass;
pub use escalation::EscalationReport;
pub use stuck::StuckVerdict;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::Config;

/// One recorded failure for one epic. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub epic: u32,
    pub class: ErrorClass,
    /// Normalized message, used by circular-approach detection.
    pub signature: String,
    pub message: String,
    /// Stamped once the strategy for this attempt is selected.
    pub strategy: Option<RecoveryStrategy>,
}

/// The strategies the handler can select. Exactly one per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetrySame,
    RollbackAndRetry,
    Skip,
    TriggerDependencyRecovery,
    Escalate,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryStrategy::RetrySame => "retry_same",
            RecoveryStrategy::RollbackAndRetry => "rollback_and_retry",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::TriggerDependencyRecovery => "trigger_dependency_recovery",
            RecoveryStrategy::Escalate => "escalate",
        };
        write!(f, "{}", s)
    }
}

/// What the handler tells the pipeline to do next.
#[derive(Debug)]
pub struct RecoveryDecision {
    pub strategy: RecoveryStrategy,
    /// False means the caller must stop re-attempting and involve a human
    /// (escalation) or mark the epic skipped.
    pub retryable: bool,
    pub reason: String,
    /// Present only for escalations.
    pub report: Option<PathBuf>,
}

/// Everything the handler needs to know about the failing epic.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub epic_name: String,
    /// Critical epics are never silently skipped.
    pub critical: bool,
    /// Keys the checkpoint/rollback collaborator.
    pub subtask_id: String,
    pub max_retries: u32,
    pub auto_escalate: bool,
}

/// Checkpoint/rollback seam, satisfied by [`CheckpointManager`] in
/// production and by doubles in tests.
pub trait RollbackCollaborator {
    /// Create a checkpoint for the subtask if none exists yet.
    fn ensure_checkpoint(&mut self, subtask_id: &str) -> anyhow::Result<()>;
    fn rollback(&mut self, subtask_id: &str) -> anyhow::Result<()>;
}

/// Used when the project has no git repository to checkpoint; rollback
/// requests succeed without restoring anything.
pub struct NoRollback;

impl RollbackCollaborator for NoRollback {
    fn ensure_checkpoint(&mut self, subtask_id: &str) -> anyhow::Result<()> {
        tracing::debug!(subtask_id, "no checkpoint backend, skipping");
        Ok(())
    }

    fn rollback(&mut self, subtask_id: &str) -> anyhow::Result<()> {
        warn!(subtask_id, "rollback requested but no checkpoint backend exists");
        Ok(())
    }
}

impl RollbackCollaborator for CheckpointManager {
    fn ensure_checkpoint(&mut self, subtask_id: &str) -> anyhow::Result<()> {
        self.checkpoint(subtask_id).map(|_| ())
    }

    fn rollback(&mut self, subtask_id: &str) -> anyhow::Result<()> {
        CheckpointManager::rollback(self, subtask_id)
    }
}

pub struct RecoveryHandler {
    attempts: HashMap<u32, Vec<RecoveryAttempt>>,
    log_path: PathBuf,
    escalations_dir: PathBuf,
}

impl RecoveryHandler {
    pub fn new(config: &Config) -> Self {
        Self {
            attempts: HashMap::new(),
            log_path: config.recovery_log.clone(),
            escalations_dir: config.escalations_dir.clone(),
        }
    }

    /// Full ordered attempt history for one epic.
    pub fn attempts(&self, epic: u32) -> &[RecoveryAttempt] {
        self.attempts.get(&epic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Record the failure, pick a strategy, perform any rollback, and return
    /// the decision. Strategy priority, first match wins:
    ///
    /// 1. retries exhausted + auto-escalate      → Escalate
    /// 2. circular approach                      → RollbackAndRetry
    /// 3. too many consecutive + auto-escalate   → Escalate
    /// 4. per-class mapping
    pub fn handle_failure(
        &mut self,
        epic: u32,
        error: &str,
        ctx: &FailureContext,
        rollback: &mut dyn RollbackCollaborator,
    ) -> RecoveryDecision {
        let class = classifier::classify(error);
        let history = self.attempts.entry(epic).or_default();
        let attempt_number = history.len() as u32 + 1;
        history.push(RecoveryAttempt {
            attempt: attempt_number,
            timestamp: Utc::now(),
            epic,
            class,
            signature: classifier::signature(error),
            message: error.to_string(),
            strategy: None,
        });
        let verdict = stuck::inspect(history);

        let (strategy, reason) = if attempt_number >= ctx.max_retries && ctx.auto_escalate {
            (
                RecoveryStrategy::Escalate,
                format!("{} attempts reached the retry ceiling", attempt_number),
            )
        } else if verdict.circular {
            (
                RecoveryStrategy::RollbackAndRetry,
                "the same failure keeps recurring; rolling back for a fresh approach".to_string(),
            )
        } else if verdict.too_many_consecutive && ctx.auto_escalate {
            (
                RecoveryStrategy::Escalate,
                format!("{} consecutive failures without progress", attempt_number),
            )
        } else {
            self.strategy_for_class(class, attempt_number, ctx)
        };

        if strategy == RecoveryStrategy::RollbackAndRetry {
            self.perform_rollback(&ctx.subtask_id, rollback);
        }

        let report = if strategy == RecoveryStrategy::Escalate {
            let history = self.attempts(epic).to_vec();
            match EscalationReport::new(epic, &ctx.epic_name, &reason, history)
                .write(&self.escalations_dir)
            {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(epic, error = %e, "failed to write escalation report");
                    None
                }
            }
        } else {
            None
        };

        // Stamp the attempt and mirror it to the durable log.
        let stamped = self
            .attempts
            .get_mut(&epic)
            .and_then(|h| h.last_mut())
            .map(|last| {
                last.strategy = Some(strategy);
                last.clone()
            });
        if let Some(last) = stamped {
            self.append_log(&last);
        }

        info!(
            epic,
            attempt = attempt_number,
            %class,
            %strategy,
            reason,
            "recovery strategy selected"
        );

        RecoveryDecision {
            retryable: !matches!(
                strategy,
                RecoveryStrategy::Escalate | RecoveryStrategy::Skip
            ),
            strategy,
            reason,
            report,
        }
    }

    fn strategy_for_class(
        &self,
        class: ErrorClass,
        attempt_number: u32,
        ctx: &FailureContext,
    ) -> (RecoveryStrategy, String) {
        match class {
            ErrorClass::Transient => (
                RecoveryStrategy::RetrySame,
                "transient failure; the same approach should work on retry".to_string(),
            ),
            ErrorClass::State => (
                RecoveryStrategy::RollbackAndRetry,
                "state inconsistency; restoring the checkpoint before retrying".to_string(),
            ),
            ErrorClass::Configuration if !ctx.critical => (
                RecoveryStrategy::Skip,
                format!("configuration failure in non-critical epic '{}'", ctx.epic_name),
            ),
            ErrorClass::Configuration | ErrorClass::Fatal => {
                if ctx.auto_escalate {
                    (
                        RecoveryStrategy::Escalate,
                        format!("{} failure needs human attention", class),
                    )
                } else {
                    (
                        RecoveryStrategy::RollbackAndRetry,
                        format!("{} failure with auto-escalate off; rolling back", class),
                    )
                }
            }
            ErrorClass::Dependency => (
                RecoveryStrategy::TriggerDependencyRecovery,
                "missing dependency; the recovery workflow should provision it".to_string(),
            ),
            ErrorClass::Unknown => match attempt_number {
                1 | 2 => (
                    RecoveryStrategy::RetrySame,
                    format!("unclassified failure, retry {} of 2", attempt_number),
                ),
                3 => (
                    RecoveryStrategy::RollbackAndRetry,
                    "unclassified failure persisted through retries; rolling back".to_string(),
                ),
                _ => (
                    RecoveryStrategy::Escalate,
                    "unclassified failure survived retry and rollback".to_string(),
                ),
            },
        }
    }

    fn perform_rollback(&self, subtask_id: &str, rollback: &mut dyn RollbackCollaborator) {
        if let Err(e) = rollback
            .ensure_checkpoint(subtask_id)
            .and_then(|_| rollback.rollback(subtask_id))
        {
            // The retry still proceeds; it just starts from the dirty tree.
            warn!(subtask_id, error = %e, "rollback failed");
        }
    }

    fn append_log(&self, attempt: &RecoveryAttempt) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            let line = serde_json::to_string(attempt).map_err(std::io::Error::other)?;
            writeln!(file, "{}", line)
        };
        if let Err(e) = write() {
            warn!(path = %self.log_path.display(), error = %e, "recovery log append failed");
        }
    }
}
