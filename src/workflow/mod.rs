//! Per-item phase execution engine.
//!
//! Each work item runs through a fixed sequence: validation, development,
//! self-healing (feature-gated), quality gate, push, checkpoint. Phase
//! completions are persisted before the next phase begins and mirrored into
//! the session store; the mirror is best-effort. The checkpoint phase either
//! resolves a human decision or parks the run in `WaitingForInput`, to be
//! picked up by [`WorkflowEngine::resume_with_decision`].

pub mod healing;

pub use healing::{Finding, FindingSeverity, HealingOutcome, StaticAnalysis};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::assignment::{self, AgentId, Assignment};
use crate::conductor_config::{ConductorToml, HealingSection};
use crate::config::Config;
use crate::errors::{PipelineError, WorkflowError};
use crate::events::{EventBus, PipelineEvent};
use crate::executor::{AgentExecutor, AgentOutcome, AgentTask, execute_with_timeout};
use crate::session::{SessionPatch, SessionStore, WorkflowPatch};

/// The fixed per-item phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Validation,
    Development,
    SelfHealing,
    QualityGate,
    Push,
    Checkpoint,
}

impl PhaseId {
    pub const SEQUENCE: [PhaseId; 6] = [
        PhaseId::Validation,
        PhaseId::Development,
        PhaseId::SelfHealing,
        PhaseId::QualityGate,
        PhaseId::Push,
        PhaseId::Checkpoint,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            PhaseId::Validation => "validation",
            PhaseId::Development => "development",
            PhaseId::SelfHealing => "self_healing",
            PhaseId::QualityGate => "quality_gate",
            PhaseId::Push => "push",
            PhaseId::Checkpoint => "checkpoint",
        }
    }

    pub fn from_slug(slug: &str) -> Option<PhaseId> {
        PhaseId::SEQUENCE.into_iter().find(|p| p.slug() == slug)
    }
}

/// Possibly-dynamic agent reference, resolved against the item's stored
/// assignment just before the phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRef {
    Assigned,
    Reviewer,
    Fixed(AgentId),
}

impl AgentRef {
    pub fn resolve(&self, assignment: &ItemAssignment) -> AgentId {
        match self {
            AgentRef::Assigned => assignment.executor.clone(),
            AgentRef::Reviewer => assignment.reviewer.clone(),
            AgentRef::Fixed(id) => id.clone(),
        }
    }
}

/// Executor/reviewer pair stored on a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAssignment {
    pub executor: AgentId,
    pub reviewer: AgentId,
}

impl From<&Assignment> for ItemAssignment {
    fn from(a: &Assignment) -> Self {
        Self {
            executor: a.executor.clone(),
            reviewer: a.reviewer.clone(),
        }
    }
}

/// One unit of pipeline work, as the Execution epic sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<ItemAssignment>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            assignment: None,
        }
    }

    /// Derive the assignment from the item's text via the category table.
    pub fn auto_assign(mut self) -> Self {
        let text = format!("{} {}", self.title, self.description);
        let (_, assignment) = assignment::assign_from_text(&text);
        self.assignment = Some(ItemAssignment::from(assignment));
        self
    }

    pub fn with_assignment(mut self, assignment: ItemAssignment) -> Self {
        self.assignment = Some(assignment);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn slug(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

/// Persisted record of one phase execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the operator answered (or will answer) at the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    Continue,
    Pause,
    Review,
    Abort,
}

impl CheckpointDecision {
    pub fn slug(&self) -> &'static str {
        match self {
            CheckpointDecision::Continue => "continue",
            CheckpointDecision::Pause => "pause",
            CheckpointDecision::Review => "review",
            CheckpointDecision::Abort => "abort",
        }
    }
}

impl std::str::FromStr for CheckpointDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(CheckpointDecision::Continue),
            "pause" => Ok(CheckpointDecision::Pause),
            "review" => Ok(CheckpointDecision::Review),
            "abort" => Ok(CheckpointDecision::Abort),
            other => Err(format!(
                "'{}' is not a checkpoint decision (continue | pause | review | abort)",
                other
            )),
        }
    }
}

impl std::fmt::Display for CheckpointDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// Lifecycle of one item's workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    WaitingForInput,
    Completed,
    Paused,
    Aborted,
    Failed,
}

/// Persisted per-item run record, `.conductor/runs/items/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRun {
    pub item_id: String,
    pub state: WorkflowState,
    pub phases: Vec<PhaseRecord>,
    pub updated_at: DateTime<Utc>,
}

/// How one item's run ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    /// Parked; `conductor decide <d>` resumes it.
    WaitingForInput,
    Paused,
    Aborted,
}

/// Checkpoint decision source. Interactive runs prompt; non-interactive
/// runs return `None` and the engine parks the item.
pub trait DecisionProvider: Send {
    fn decide(&mut self, item_id: &str) -> Option<CheckpointDecision>;
}

/// Never answers; every checkpoint parks the run.
pub struct NonInteractive;

impl DecisionProvider for NonInteractive {
    fn decide(&mut self, _item_id: &str) -> Option<CheckpointDecision> {
        None
    }
}

/// Drives one work item through the phase sequence.
pub struct WorkflowEngine {
    executor: Arc<dyn AgentExecutor>,
    analysis: Arc<dyn StaticAnalysis>,
    decisions: Box<dyn DecisionProvider>,
    events: Arc<Mutex<EventBus>>,
    session: Option<SessionStore>,
    items_dir: PathBuf,
    healing: HealingSection,
    pass_threshold: u8,
    timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(
        config: &Config,
        settings: &ConductorToml,
        executor: Arc<dyn AgentExecutor>,
        analysis: Arc<dyn StaticAnalysis>,
    ) -> Self {
        Self {
            executor,
            analysis,
            decisions: Box::new(NonInteractive),
            events: Arc::new(Mutex::new(EventBus::new())),
            session: None,
            items_dir: config.runs_dir.join("items"),
            healing: settings.healing.clone(),
            pass_threshold: settings.gate.pass_threshold.min(100),
            timeout: Duration::from_secs(settings.defaults.agent_timeout_secs),
        }
    }

    pub fn with_session(mut self, session: SessionStore) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_events(mut self, events: Arc<Mutex<EventBus>>) -> Self {
        self.events = events;
        self
    }

    pub fn with_decisions(mut self, decisions: Box<dyn DecisionProvider>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn run_path(&self, item_id: &str) -> PathBuf {
        self.items_dir.join(format!("{}.json", item_id))
    }

    /// Run one item through the full phase sequence.
    pub async fn run_item(
        &mut self,
        item: &WorkItem,
        context: &str,
    ) -> Result<ItemOutcome, WorkflowError> {
        let mut run = ItemRun {
            item_id: item.id.clone(),
            state: WorkflowState::Running,
            phases: Vec::new(),
            updated_at: Utc::now(),
        };

        // validation: fails closed before any agent runs.
        self.begin_phase(&mut run, PhaseId::Validation, None);
        let assignment = match &item.assignment {
            None => {
                self.record_failure(&mut run, "work item has no executor assignment");
                return Err(WorkflowError::MissingAssignment {
                    item: item.id.clone(),
                });
            }
            Some(a) if a.executor == a.reviewer => {
                self.record_failure(&mut run, "implementer and reviewer are the same agent");
                return Err(WorkflowError::ReviewerConflict {
                    item: item.id.clone(),
                    agent: a.executor.to_string(),
                });
            }
            Some(a) => a.clone(),
        };
        self.finish_phase(&mut run, PhaseStatus::Completed, None)?;

        // development
        let implementer = AgentRef::Assigned.resolve(&assignment);
        self.begin_phase(&mut run, PhaseId::Development, Some(&implementer));
        let task = AgentTask::new(&item.id, &item.description).for_phase(PhaseId::Development.slug());
        let developed = match execute_with_timeout(
            self.executor.as_ref(),
            &implementer,
            &task,
            context,
            self.timeout,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(&mut run, &e.to_string());
                return Err(WorkflowError::Other(e));
            }
        };
        self.finish_phase(
            &mut run,
            PhaseStatus::Completed,
            serde_json::to_value(&developed).ok(),
        )?;

        // self_healing, only when the feature flag is on
        if self.healing.enabled {
            self.begin_phase(&mut run, PhaseId::SelfHealing, Some(&implementer));
            match healing::run_healing(
                &self.executor,
                &self.analysis,
                &implementer,
                &item.id,
                &self.healing,
                self.timeout,
            )
            .await
            {
                Ok(outcome) => self.finish_phase(
                    &mut run,
                    PhaseStatus::Completed,
                    serde_json::to_value(&outcome).ok(),
                )?,
                Err(e) => {
                    self.record_failure(&mut run, &e.to_string());
                    return Err(WorkflowError::Other(e));
                }
            }
        } else {
            self.begin_phase(&mut run, PhaseId::SelfHealing, None);
            self.finish_phase(&mut run, PhaseStatus::Skipped, None)?;
        }

        // quality_gate: the reviewer must be a second pair of eyes.
        let reviewer = AgentRef::Reviewer.resolve(&assignment);
        self.begin_phase(&mut run, PhaseId::QualityGate, Some(&reviewer));
        if reviewer == implementer {
            self.record_failure(&mut run, "reviewer equals implementer");
            return Err(WorkflowError::ReviewerConflict {
                item: item.id.clone(),
                agent: reviewer.to_string(),
            });
        }
        let review_task = AgentTask::new(
            format!("{}-review", item.id),
            format!("Review the changes for '{}': {}", item.title, developed.summary),
        )
        .for_phase(PhaseId::QualityGate.slug());
        let review = match execute_with_timeout(
            self.executor.as_ref(),
            &reviewer,
            &review_task,
            context,
            self.timeout,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(&mut run, &e.to_string());
                return Err(WorkflowError::Other(e));
            }
        };
        if let Some(message) = self.review_rejection(&review) {
            self.record_failure(&mut run, &message);
            return Err(WorkflowError::Other(anyhow!(message)));
        }
        self.finish_phase(
            &mut run,
            PhaseStatus::Completed,
            serde_json::to_value(&review).ok(),
        )?;

        // push: a fixed agent publishes, whatever the item's category.
        let pusher = AgentRef::Fixed(AgentId::new("@dev")).resolve(&assignment);
        self.begin_phase(&mut run, PhaseId::Push, Some(&pusher));
        let push_task = AgentTask::new(
            format!("{}-push", item.id),
            format!("Commit and push the completed work for '{}'", item.title),
        )
        .for_phase(PhaseId::Push.slug());
        match execute_with_timeout(
            self.executor.as_ref(),
            &pusher,
            &push_task,
            context,
            self.timeout,
        )
        .await
        {
            Ok(outcome) => self.finish_phase(
                &mut run,
                PhaseStatus::Completed,
                serde_json::to_value(&outcome).ok(),
            )?,
            Err(e) => {
                self.record_failure(&mut run, &e.to_string());
                return Err(WorkflowError::Other(e));
            }
        }

        // checkpoint
        self.begin_phase(&mut run, PhaseId::Checkpoint, None);
        self.resolve_checkpoint(&mut run)
    }

    /// Resumption entry point for a parked run (`conductor decide <d>`).
    pub fn resume_with_decision(
        &mut self,
        item_id: &str,
        decision: CheckpointDecision,
    ) -> Result<ItemOutcome, WorkflowError> {
        let mut run = self.load_run(item_id)?.ok_or(WorkflowError::NoDecisionPending {
            item: item_id.to_string(),
        })?;
        if run.state != WorkflowState::WaitingForInput {
            return Err(WorkflowError::NoDecisionPending {
                item: item_id.to_string(),
            });
        }
        run.state = WorkflowState::Running;
        self.apply_decision(&mut run, decision)
    }

    fn resolve_checkpoint(&mut self, run: &mut ItemRun) -> Result<ItemOutcome, WorkflowError> {
        match self.decisions.decide(&run.item_id) {
            Some(decision) => self.apply_decision(run, decision),
            None => {
                run.state = WorkflowState::WaitingForInput;
                self.finish_phase(run, PhaseStatus::Completed, Some(serde_json::json!("waiting")))?;
                info!(item = %run.item_id, "checkpoint parked, waiting for a decision");
                Ok(ItemOutcome::WaitingForInput)
            }
        }
    }

    fn apply_decision(
        &mut self,
        run: &mut ItemRun,
        mut decision: CheckpointDecision,
    ) -> Result<ItemOutcome, WorkflowError> {
        loop {
            self.publish(PipelineEvent::CheckpointDecision {
                item: run.item_id.clone(),
                decision: decision.slug().to_string(),
            });
            match decision {
                CheckpointDecision::Review => {
                    // Review re-enters the checkpoint.
                    match self.decisions.decide(&run.item_id) {
                        Some(next) => decision = next,
                        None => {
                            run.state = WorkflowState::WaitingForInput;
                            self.persist(run)?;
                            return Ok(ItemOutcome::WaitingForInput);
                        }
                    }
                }
                CheckpointDecision::Continue => {
                    run.state = WorkflowState::Completed;
                    return self.close_checkpoint(run, decision, ItemOutcome::Completed);
                }
                CheckpointDecision::Pause => {
                    run.state = WorkflowState::Paused;
                    return self.close_checkpoint(run, decision, ItemOutcome::Paused);
                }
                CheckpointDecision::Abort => {
                    run.state = WorkflowState::Aborted;
                    return self.close_checkpoint(run, decision, ItemOutcome::Aborted);
                }
            }
        }
    }

    fn close_checkpoint(
        &self,
        run: &mut ItemRun,
        decision: CheckpointDecision,
        outcome: ItemOutcome,
    ) -> Result<ItemOutcome, WorkflowError> {
        if run.phases.last().is_some_and(|p| p.completed_at.is_none()) {
            self.finish_phase(
                run,
                PhaseStatus::Completed,
                Some(serde_json::json!(decision.slug())),
            )?;
        } else {
            // Resumed run: the checkpoint phase record was already closed
            // when the run parked.
            run.updated_at = Utc::now();
            self.persist(run)?;
        }
        Ok(outcome)
    }

    fn review_rejection(&self, review: &AgentOutcome) -> Option<String> {
        if review.blocking {
            return Some(format!("review blocked the change: {}", review.summary));
        }
        let confidence = review.confidence.unwrap_or(0);
        if confidence < self.pass_threshold {
            return Some(format!(
                "review confidence {} is below the pass threshold {}",
                confidence, self.pass_threshold
            ));
        }
        None
    }

    fn begin_phase(&self, run: &mut ItemRun, phase: PhaseId, agent: Option<&AgentId>) {
        self.publish(PipelineEvent::PhaseStarted {
            item: run.item_id.clone(),
            phase: phase.slug().to_string(),
            agent: agent.map(|a| a.to_string()).unwrap_or_default(),
        });
        run.phases.push(PhaseRecord {
            phase: phase.slug().to_string(),
            status: PhaseStatus::Running,
            agent: agent.map(|a| a.to_string()),
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        });
    }

    /// Close the current phase, persist the run, mirror it, announce it.
    fn finish_phase(
        &self,
        run: &mut ItemRun,
        status: PhaseStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), WorkflowError> {
        let phase_slug = self.close_record(run, status, result, None);
        run.updated_at = Utc::now();
        self.persist(run)?;
        self.mirror(run);
        self.publish(PipelineEvent::PhaseCompleted {
            item: run.item_id.clone(),
            phase: phase_slug,
            status: status.slug().to_string(),
        });
        Ok(())
    }

    /// Mark the current phase failed and persist best-effort. The caller
    /// returns the typed error; recovery happens one level up.
    fn record_failure(&self, run: &mut ItemRun, message: &str) {
        let phase_slug = self.close_record(run, PhaseStatus::Failed, None, Some(message.to_string()));
        run.state = WorkflowState::Failed;
        run.updated_at = Utc::now();
        if let Err(e) = self.persist(run) {
            warn!(item = %run.item_id, error = %e, "failed to persist failed run");
        }
        self.mirror(run);
        self.publish(PipelineEvent::PhaseCompleted {
            item: run.item_id.clone(),
            phase: phase_slug,
            status: PhaseStatus::Failed.slug().to_string(),
        });
    }

    fn close_record(
        &self,
        run: &mut ItemRun,
        status: PhaseStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> String {
        match run.phases.last_mut() {
            Some(record) => {
                record.status = status;
                record.completed_at = Some(Utc::now());
                record.result = result;
                record.error = error;
                record.phase.clone()
            }
            None => String::new(),
        }
    }

    fn persist(&self, run: &ItemRun) -> Result<(), WorkflowError> {
        std::fs::create_dir_all(&self.items_dir).map_err(|source| {
            PipelineError::PersistFailed {
                path: self.items_dir.clone(),
                source,
            }
        })?;
        let path = self.run_path(&run.item_id);
        let json = serde_json::to_string_pretty(run)
            .map_err(|e| WorkflowError::Other(anyhow::Error::new(e)))?;
        std::fs::write(&path, json)
            .map_err(|source| PipelineError::PersistFailed { path, source })?;
        Ok(())
    }

    fn load_run(&self, item_id: &str) -> Result<Option<ItemRun>, WorkflowError> {
        let path = self.run_path(item_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|source| PipelineError::PersistFailed { path: path.clone(), source })?;
        let run = serde_json::from_str(&content)
            .map_err(|e| WorkflowError::Other(anyhow::Error::new(e)))?;
        Ok(Some(run))
    }

    /// Best-effort session mirror; a failed write is healed by the next one.
    fn mirror(&self, run: &ItemRun) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(last) = run.phases.last() else {
            return;
        };
        let mut results = BTreeMap::new();
        if let Ok(value) = serde_json::to_value(last) {
            results.insert(last.phase.clone(), value);
        }
        let patch = SessionPatch::default().workflow(WorkflowPatch {
            current_phase: Some(Some(last.phase.clone())),
            attempt: None,
            phase_results: Some(results),
        });
        if let Err(e) = session.update(patch) {
            warn!(item = %run.item_id, error = %e, "session mirror write failed");
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if let Ok(mut bus) = self.events.lock() {
            bus.publish(event);
        }
    }
}
