//! Production [`AgentExecutor`] that spawns an external agent CLI.
//!
//! The agent command comes from `CONDUCTOR_AGENT_CMD` (default `claude`).
//! The prompt goes in via stdin; the outcome comes back as the last JSON
//! object on stdout, with plain text accepted as a degraded fallback. The
//! same pattern covers static analysis via `CONDUCTOR_LINT_CMD`, emitting
//! one JSON finding per line.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentExecutor, AgentOutcome, AgentTask};
use crate::assignment::AgentId;
use crate::workflow::{Finding, StaticAnalysis};

/// Spawns one agent process per task, prompt via stdin.
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ProcessExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let raw = std::env::var("CONDUCTOR_AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        Self {
            program,
            args: parts.collect(),
            working_dir: working_dir.into(),
        }
    }

    fn render_prompt(agent: &AgentId, task: &AgentTask, context: &str) -> String {
        let mut prompt = format!(
            "You are acting as {}.\n\nTask {}: {}\n",
            agent, task.id, task.description
        );
        if let Some(phase) = &task.phase {
            prompt.push_str(&format!("Phase: {}\n", phase));
        }
        if !context.is_empty() {
            prompt.push_str("\n## Context from prior work\n\n");
            prompt.push_str(context);
            prompt.push('\n');
        }
        prompt.push_str(
            "\nWhen finished, print a single JSON object on its own line: \
             {\"summary\": \"...\", \"confidence\": 0-100, \
             \"files_modified\": [...], \"blocking\": false}\n",
        );
        prompt
    }
}

#[async_trait]
impl AgentExecutor for ProcessExecutor {
    async fn execute(
        &self,
        agent: &AgentId,
        task: &AgentTask,
        context: &str,
    ) -> Result<AgentOutcome> {
        let prompt = Self::render_prompt(agent, task, context);
        debug!(agent = %agent, task = %task.id, program = %self.program, "spawning agent process");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed waiting for the agent process")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Agent command '{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_outcome(&stdout))
    }
}

/// Extract the outcome from agent stdout.
///
/// The last line that parses as an [`AgentOutcome`] wins; anything else
/// degrades to a plain-text summary with no confidence, which the quality
/// gate treats as not passing.
pub fn parse_outcome(stdout: &str) -> AgentOutcome {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        if let Ok(outcome) = serde_json::from_str::<AgentOutcome>(trimmed) {
            return outcome;
        }
    }
    AgentOutcome {
        summary: stdout.trim().to_string(),
        ..AgentOutcome::default()
    }
}

/// Static analysis by shelling out to a lint command.
///
/// With `CONDUCTOR_LINT_CMD` unset the scan is a no-op; healing then sees a
/// clean project and finishes immediately.
pub struct CommandAnalysis {
    command: Option<String>,
    working_dir: PathBuf,
}

impl CommandAnalysis {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: std::env::var("CONDUCTOR_LINT_CMD").ok(),
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl StaticAnalysis for CommandAnalysis {
    async fn scan(&self) -> Result<Vec<Finding>> {
        let Some(command) = &self.command else {
            return Ok(Vec::new());
        };

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run lint command '{}'", command))?;

        // Most linters exit non-zero when they find something; the findings
        // themselves are the signal, not the exit code.
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_findings(&stdout))
    }
}

/// One JSON finding per line; lines that are not findings are skipped.
pub fn parse_findings(stdout: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<Finding>(trimmed) {
            Ok(finding) => findings.push(finding),
            Err(e) => warn!(line = trimmed, error = %e, "unparsable finding line, skipped"),
        }
    }
    findings
}
