//! Self-healing phase: a bounded scan-and-fix loop over static-analysis
//! findings.
//!
//! Each iteration scans, filters by severity, hands the surviving findings
//! to the assigned agent as a fix task, and rescans. The loop stops when the
//! scan comes back clean, when an iteration fixes nothing, or when the
//! iteration ceiling is reached, whichever happens first.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::assignment::AgentId;
use crate::conductor_config::HealingSection;
use crate::executor::{AgentExecutor, AgentTask, execute_with_timeout};

/// Severity ladder for analysis findings. Ordering matters: the healing
/// filter keeps findings at or above the configured minimum.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FindingSeverity::Low => "low",
            FindingSeverity::Medium => "medium",
            FindingSeverity::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// One issue reported by the analysis collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

impl Finding {
    pub fn new(severity: FindingSeverity, file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            file: file.into(),
            line: None,
            message: message.into(),
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    fn render(&self) -> String {
        match self.line {
            Some(line) => format!("[{}] {}:{} {}", self.severity, self.file, line, self.message),
            None => format!("[{}] {} {}", self.severity, self.file, self.message),
        }
    }
}

/// Static-analysis seam. Production implementations shell out to linters
/// and test runners; tests script the scan results.
#[async_trait]
pub trait StaticAnalysis: Send + Sync {
    async fn scan(&self) -> Result<Vec<Finding>>;
}

/// What the healing loop reports back to the phase engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealingOutcome {
    pub iterations: u32,
    pub fixed: usize,
    pub remaining: usize,
}

impl HealingOutcome {
    pub fn is_clean(&self) -> bool {
        self.remaining == 0
    }
}

/// Run the scan-and-fix loop for one work item.
///
/// Fix attempts that error propagate to the caller; the epic-level recovery
/// handler owns retries, not this loop.
pub async fn run_healing(
    executor: &Arc<dyn AgentExecutor>,
    analysis: &Arc<dyn StaticAnalysis>,
    agent: &AgentId,
    item_id: &str,
    settings: &HealingSection,
    timeout: Duration,
) -> Result<HealingOutcome> {
    let mut outcome = HealingOutcome::default();
    let mut open = actionable(analysis.scan().await?, settings.min_severity);
    let initial = open.len();

    while !open.is_empty() && outcome.iterations < settings.max_iterations {
        outcome.iterations += 1;
        debug!(
            item = item_id,
            iteration = outcome.iterations,
            open = open.len(),
            "healing iteration"
        );

        let task = fix_task(item_id, outcome.iterations, &open);
        execute_with_timeout(executor.as_ref(), agent, &task, "", timeout).await?;

        let next = actionable(analysis.scan().await?, settings.min_severity);
        let progressed = next.len() < open.len();
        open = next;
        if !progressed {
            info!(item = item_id, open = open.len(), "healing made no progress, stopping");
            break;
        }
    }

    outcome.fixed = initial.saturating_sub(open.len());
    outcome.remaining = open.len();
    info!(
        item = item_id,
        iterations = outcome.iterations,
        fixed = outcome.fixed,
        remaining = outcome.remaining,
        "healing finished"
    );
    Ok(outcome)
}

fn actionable(findings: Vec<Finding>, min_severity: FindingSeverity) -> Vec<Finding> {
    findings
        .into_iter()
        .filter(|f| f.severity >= min_severity)
        .collect()
}

fn fix_task(item_id: &str, iteration: u32, findings: &[Finding]) -> AgentTask {
    let mut description = String::from("Fix the following analysis findings:\n");
    for finding in findings {
        let _ = writeln!(description, "- {}", finding.render());
    }
    AgentTask::new(format!("{}-healing-{}", item_id, iteration), description)
        .for_phase("self_healing")
}
