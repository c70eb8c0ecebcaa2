//! The agent execution seam.
//!
//! Everything that actually talks to an LLM or spawns a terminal lives
//! behind [`AgentExecutor`]; the engine treats it as an opaque awaited call.
//! This module supplies the wrapping the engine relies on: a hard timeout
//! whose expiry is pattern-matchable as transient, and a bounded parallel
//! runner with cooperative cancellation for independent tasks.

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::assignment::AgentId;

/// Hard ceiling on parallel agent fan-out, whatever the caller asks for.
pub const MAX_PARALLEL: usize = 4;

/// One unit of work handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub description: String,
    /// Phase the task belongs to, when invoked from the workflow engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl AgentTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            phase: None,
        }
    }

    pub fn for_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

/// What an agent reports back on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub summary: String,
    /// Self-reported confidence (0-100), consumed by the quality gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    /// Marks the outcome as unusable despite the agent returning cleanly.
    #[serde(default)]
    pub blocking: bool,
}

/// The external execution collaborator. Implementations are opaque to the
/// engine; errors they throw go straight to the recovery handler.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent: &AgentId,
        task: &AgentTask,
        context: &str,
    ) -> Result<AgentOutcome>;
}

/// Run one agent call under a wall-clock ceiling.
///
/// Expiry surfaces as an error whose message contains "timeout" so the
/// recovery classifier files it as transient.
pub async fn execute_with_timeout(
    executor: &dyn AgentExecutor,
    agent: &AgentId,
    task: &AgentTask,
    context: &str,
    timeout: Duration,
) -> Result<AgentOutcome> {
    match tokio::time::timeout(timeout, executor.execute(agent, task, context)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(agent = %agent, task = %task.id, ?timeout, "agent invocation timed out");
            Err(anyhow::anyhow!(
                "Agent {} timeout after {}s on task '{}'",
                agent,
                timeout.as_secs(),
                task.id
            ))
        }
    }
}

/// Cooperative cancellation handle shared between the runner and callers.
///
/// Cancelling never interrupts an in-flight external call; it stops further
/// admissions and marks unstarted work as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-task result inside a batch.
#[derive(Debug, Clone)]
pub enum TaskStatus {
    Completed(AgentOutcome),
    Failed(String),
    Cancelled,
}

/// Outcome of a batch run: partial results plus a failure list, always.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub results: Vec<(String, TaskStatus)>,
}

impl BatchResult {
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| matches!(s, TaskStatus::Completed(_)))
            .count()
    }

    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.results
            .iter()
            .filter_map(|(id, s)| match s {
                TaskStatus::Failed(msg) => Some((id.as_str(), msg.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| matches!(s, TaskStatus::Cancelled))
            .count()
    }
}

/// Runs independent tasks with "start N, wait for any, admit the next"
/// scheduling. A task failure never aborts its siblings.
pub struct ParallelRunner {
    executor: Arc<dyn AgentExecutor>,
    max_parallel: usize,
    timeout: Duration,
    cancel: CancelFlag,
}

impl ParallelRunner {
    pub fn new(executor: Arc<dyn AgentExecutor>, requested_parallel: usize, timeout: Duration) -> Self {
        Self {
            executor,
            max_parallel: requested_parallel.clamp(1, MAX_PARALLEL),
            timeout,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run every `(agent, task, context)` triple to completion or
    /// cancellation. Results come back in task order.
    pub async fn run_all(&self, work: Vec<(AgentId, AgentTask, String)>) -> BatchResult {
        let mut statuses: Vec<Option<TaskStatus>> = (0..work.len()).map(|_| None).collect();
        let ids: Vec<String> = work.iter().map(|(_, task, _)| task.id.clone()).collect();

        let mut join_set: JoinSet<(usize, TaskStatus)> = JoinSet::new();
        let mut queue = work.into_iter().enumerate();

        loop {
            // Admit until the window is full, unless cancelled.
            while join_set.len() < self.max_parallel && !self.cancel.is_cancelled() {
                let Some((index, (agent, task, context))) = queue.next() else {
                    break;
                };
                let executor = self.executor.clone();
                let timeout = self.timeout;
                debug!(task = %task.id, in_flight = join_set.len() + 1, "task admitted");
                join_set.spawn(async move {
                    let status = match execute_with_timeout(
                        executor.as_ref(),
                        &agent,
                        &task,
                        &context,
                        timeout,
                    )
                    .await
                    {
                        Ok(outcome) => TaskStatus::Completed(outcome),
                        Err(e) => TaskStatus::Failed(e.to_string()),
                    };
                    (index, status)
                });
            }

            match join_set.join_next().await {
                Some(Ok((index, status))) => statuses[index] = Some(status),
                Some(Err(e)) => warn!(error = %e, "batch task panicked"),
                None => break, // window empty and nothing left to admit
            }
        }

        // Whatever was never admitted is cancelled, not silently dropped.
        for (index, (_, task, _)) in queue {
            debug!(task = %task.id, "task cancelled before admission");
            statuses[index] = Some(TaskStatus::Cancelled);
        }

        BatchResult {
            results: ids
                .into_iter()
                .zip(statuses)
                .map(|(id, status)| (id, status.unwrap_or(TaskStatus::Cancelled)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Test double: scripted outcomes, optional delay, concurrency watermark.
    struct StubExecutor {
        delay: Duration,
        fail_ids: Vec<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_ids: Vec::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, ids: &[&str]) -> Self {
            self.fail_ids = ids.iter().map(|s| s.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl AgentExecutor for StubExecutor {
        async fn execute(
            &self,
            _agent: &AgentId,
            task: &AgentTask,
            _context: &str,
        ) -> Result<AgentOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_ids.contains(&task.id) {
                anyhow::bail!("task {} exploded", task.id);
            }
            Ok(AgentOutcome {
                summary: format!("done {}", task.id),
                confidence: Some(90),
                ..AgentOutcome::default()
            })
        }
    }

    fn work(n: usize) -> Vec<(AgentId, AgentTask, String)> {
        (0..n)
            .map(|i| {
                (
                    AgentId::new("@dev"),
                    AgentTask::new(format!("t{}", i), "work"),
                    String::new(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_tasks_complete() {
        let runner = ParallelRunner::new(
            Arc::new(StubExecutor::new(Duration::from_millis(5))),
            2,
            Duration::from_secs(5),
        );
        let batch = runner.run_all(work(6)).await;
        assert_eq!(batch.completed(), 6);
        assert!(batch.failures().is_empty());
        // Results preserve task order.
        let ids: Vec<&str> = batch.results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t3", "t4", "t5"]);
    }

    #[tokio::test]
    async fn test_parallelism_never_exceeds_bound() {
        let stub = Arc::new(StubExecutor::new(Duration::from_millis(20)));
        let runner = ParallelRunner::new(stub.clone(), 3, Duration::from_secs(5));
        runner.run_all(work(10)).await;
        assert!(stub.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_requested_parallelism_is_clamped() {
        let stub = Arc::new(StubExecutor::new(Duration::from_millis(10)));
        let runner = ParallelRunner::new(stub.clone(), 64, Duration::from_secs(5));
        assert_eq!(runner.max_parallel(), MAX_PARALLEL);
        runner.run_all(work(12)).await;
        assert!(stub.peak.load(Ordering::SeqCst) <= MAX_PARALLEL);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let executor = StubExecutor::new(Duration::from_millis(5)).failing(&["t1", "t3"]);
        let runner = ParallelRunner::new(Arc::new(executor), 2, Duration::from_secs(5));
        let batch = runner.run_all(work(5)).await;

        assert_eq!(batch.completed(), 3);
        let failures = batch.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().any(|(id, msg)| *id == "t1" && msg.contains("exploded")));
    }

    #[tokio::test]
    async fn test_timeout_error_mentions_timeout() {
        let executor = StubExecutor::new(Duration::from_secs(60));
        let err = execute_with_timeout(
            &executor,
            &AgentId::new("@dev"),
            &AgentTask::new("t0", "slow work"),
            "",
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_further_admissions() {
        let runner = ParallelRunner::new(
            Arc::new(StubExecutor::new(Duration::from_millis(30))),
            1,
            Duration::from_secs(5),
        );
        let flag = runner.cancel_flag();
        flag.cancel();

        let batch = runner.run_all(work(4)).await;
        // Nothing was admitted after the flag was set.
        assert_eq!(batch.completed(), 0);
        assert_eq!(batch.cancelled(), 4);
    }

    #[tokio::test]
    async fn test_empty_batch_is_fine() {
        let runner = ParallelRunner::new(
            Arc::new(StubExecutor::new(Duration::ZERO)),
            2,
            Duration::from_secs(5),
        );
        let batch = runner.run_all(Vec::new()).await;
        assert!(batch.results.is_empty());
    }
}
