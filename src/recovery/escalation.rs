//! Escalation reports: the durable artifact a human picks up when
//! automated recovery gives up.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

use super::RecoveryAttempt;
use super::classifier::ErrorClass;

/// One escalation event, serialized to
/// `.conductor/escalations/escalation-<epic>-<ts>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub epic: u32,
    pub epic_name: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// Full ordered attempt history for the failing epic.
    pub attempts: Vec<RecoveryAttempt>,
    pub suggestions: Vec<String>,
}

impl EscalationReport {
    pub fn new(
        epic: u32,
        epic_name: &str,
        reason: &str,
        attempts: Vec<RecoveryAttempt>,
    ) -> Self {
        let dominant = attempts
            .last()
            .map(|a| a.class)
            .unwrap_or(ErrorClass::Unknown);
        Self {
            epic,
            epic_name: epic_name.to_string(),
            created_at: Utc::now(),
            reason: reason.to_string(),
            attempts,
            suggestions: suggestions_for(dominant),
        }
    }

    /// Write the report under `escalations_dir`, returning its path.
    pub fn write(&self, escalations_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(escalations_dir)
            .context("Failed to create escalations directory")?;
        let path = escalations_dir.join(format!(
            "escalation-{}-{}.json",
            self.epic,
            self.created_at.format("%Y%m%d%H%M%S")
        ));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write escalation report: {}", path.display()))?;
        error!(
            epic = self.epic,
            report = %path.display(),
            "escalated to human review"
        );
        Ok(path)
    }
}

/// Remediation hints by the dominant error class.
fn suggestions_for(class: ErrorClass) -> Vec<String> {
    let hints: &[&str] = match class {
        ErrorClass::Transient => &[
            "Check network connectivity and upstream service health.",
            "Re-run once the rate limit or outage clears; the work itself looks sound.",
        ],
        ErrorClass::State => &[
            "Inspect the persisted run record and session state for corruption.",
            "Roll the workspace back to the last checkpoint before retrying.",
        ],
        ErrorClass::Configuration => &[
            "Review .conductor/conductor.toml for missing or invalid settings.",
            "Compare the epic's override section against the documented keys.",
        ],
        ErrorClass::Dependency => &[
            "Verify the required files, binaries, and modules exist on this machine.",
            "Run the environment epic again to re-provision missing dependencies.",
        ],
        ErrorClass::Fatal => &[
            "This failure is not retryable; read the full attempt history below.",
            "Fix the underlying defect before resuming the pipeline.",
        ],
        ErrorClass::Unknown => &[
            "The error did not match any known family; inspect the raw messages.",
            "Consider adding a classifier pattern if this failure shape recurs.",
        ],
    };
    hints.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::classifier::signature;
    use tempfile::tempdir;

    fn attempts(messages: &[&str]) -> Vec<RecoveryAttempt> {
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| RecoveryAttempt {
                attempt: i as u32 + 1,
                timestamp: Utc::now(),
                epic: 3,
                class: super::super::classifier::classify(m),
                signature: signature(m),
                message: m.to_string(),
                strategy: None,
            })
            .collect()
    }

    #[test]
    fn test_report_carries_full_history_and_suggestions() {
        let report = EscalationReport::new(
            3,
            "Execution",
            "retries exhausted",
            attempts(&["timeout", "timeout", "timeout"]),
        );
        assert_eq!(report.attempts.len(), 3);
        assert!(!report.suggestions.is_empty());
        // Suggestions follow the last attempt's class (transient).
        assert!(report.suggestions[0].contains("network"));
    }

    #[test]
    fn test_suggestions_track_dominant_class() {
        let fatal = EscalationReport::new(1, "Specification", "fatal", attempts(&["panic at lib.rs"]));
        assert!(fatal.suggestions.iter().any(|s| s.contains("not retryable")));

        let empty = EscalationReport::new(1, "Specification", "stuck", Vec::new());
        assert!(empty.suggestions.iter().any(|s| s.contains("known family")));
    }

    #[test]
    fn test_write_produces_parseable_file() {
        let dir = tempdir().unwrap();
        let report = EscalationReport::new(
            4,
            "Quality",
            "circular approach",
            attempts(&["corrupt state", "corrupt state"]),
        );
        let path = report.write(dir.path()).unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().starts_with("escalation-4-"));
        let loaded: EscalationReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.epic, 4);
        assert_eq!(loaded.attempts.len(), 2);
        assert_eq!(loaded.reason, "circular approach");
    }
}
