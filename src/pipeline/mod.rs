//! The pipeline state machine: fixed epic sequence, persisted run records,
//! quality gating, and recovery-driven retries.
//!
//! A pipeline run walks five epics in order, persisting after every epic so
//! a crash at any point resumes idempotently: completed epics are skipped,
//! retry counters survive, and the quality gate re-evaluates only what ran.
//! Illegal state transitions are logged and ignored, never panicked on.

pub mod gate;

pub use gate::GateVerdict;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::conductor_config::{ConductorToml, condition};
use crate::config::Config;
use crate::detect::{TechProfile, detect_project};
use crate::errors::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::executor::AgentOutcome;
use crate::recovery::{FailureContext, NoRollback, RecoveryHandler, RecoveryStrategy, RollbackCollaborator};

pub const RUN_SCHEMA_VERSION: u32 = 1;

/// Persisted runs older than this are never auto-resumed.
pub const RESUME_STALENESS_HOURS: i64 = 24;

/// Top-level pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Initialized,
    Ready,
    InProgress,
    Complete,
    Blocked,
}

impl PipelineState {
    fn can_transition_to(self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Initialized, Ready)
                | (Ready, InProgress)
                | (InProgress, Complete)
                | (InProgress, Blocked)
                | (Blocked, Ready)
                | (Blocked, InProgress)
                | (Blocked, Complete)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Initialized => "Initialized",
            PipelineState::Ready => "Ready",
            PipelineState::InProgress => "InProgress",
            PipelineState::Complete => "Complete",
            PipelineState::Blocked => "Blocked",
        };
        write!(f, "{}", s)
    }
}

/// One row of the fixed epic sequence.
#[derive(Debug)]
pub struct EpicDef {
    pub number: u32,
    pub name: &'static str,
    pub slug: &'static str,
    /// `None` means the agent is resolved per work item (the Execution epic).
    pub agent: Option<&'static str>,
    /// Critical epics are never silently skipped.
    pub critical: bool,
}

pub static EPIC_TABLE: [EpicDef; 5] = [
    EpicDef { number: 1, name: "Specification", slug: "specification", agent: Some("@architect"), critical: true },
    EpicDef { number: 2, name: "Environment", slug: "environment", agent: Some("@devops"), critical: false },
    EpicDef { number: 3, name: "Execution", slug: "execution", agent: None, critical: true },
    EpicDef { number: 4, name: "Quality", slug: "quality", agent: Some("@qa"), critical: true },
    EpicDef { number: 5, name: "Publication", slug: "publication", agent: Some("@dev"), critical: false },
];

pub fn epic_def(number: u32) -> Option<&'static EpicDef> {
    EPIC_TABLE.iter().find(|def| def.number == number)
}

/// Digest of the epic table. A persisted run whose fingerprint differs was
/// produced by a different pipeline definition and is not auto-resumed.
pub fn definition_fingerprint() -> String {
    let mut hasher = Sha256::new();
    for def in &EPIC_TABLE {
        hasher.update(format!(
            "{}|{}|{}|{}\n",
            def.number,
            def.slug,
            def.agent.unwrap_or("per-item"),
            def.critical
        ));
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

/// Persisted per-epic record inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicRecord {
    pub number: u32,
    pub name: String,
    pub status: EpicStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EpicRecord {
    fn fresh(def: &EpicDef) -> Self {
        Self {
            number: def.number,
            name: def.name.to_string(),
            status: EpicStatus::Pending,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// The persisted run record, `.conductor/runs/<work_item_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub schema_version: u32,
    pub workflow_id: String,
    pub work_item_id: String,
    pub status: PipelineState,
    pub epics: BTreeMap<u32, EpicRecord>,
    /// Attempt counters per epic, surviving restarts.
    #[serde(default)]
    pub retries: BTreeMap<u32, u32>,
    #[serde(default)]
    pub error_log: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<TechProfile>,
    #[serde(default)]
    pub definition_fingerprint: String,
}

impl PipelineRun {
    fn fresh(work_item_id: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            workflow_id: Uuid::new_v4().to_string(),
            work_item_id: work_item_id.to_string(),
            status: PipelineState::Initialized,
            epics: EPIC_TABLE
                .iter()
                .map(|def| (def.number, EpicRecord::fresh(def)))
                .collect(),
            retries: BTreeMap::new(),
            error_log: Vec::new(),
            started_at: now,
            updated_at: now,
            environment: None,
            definition_fingerprint: definition_fingerprint(),
        }
    }

    /// Load a persisted record, rejecting documents missing the required
    /// `workflow_id`, `status`, and `epics` fields.
    pub fn load(path: &std::path::Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            PipelineError::PersistFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|_| PipelineError::InvalidRunRecord {
                path: path.to_path_buf(),
            })?;
        for field in ["workflow_id", "status", "epics"] {
            if value.get(field).is_none() {
                return Err(PipelineError::InvalidRunRecord {
                    path: path.to_path_buf(),
                });
            }
        }
        serde_json::from_value(value).map_err(|_| PipelineError::InvalidRunRecord {
            path: path.to_path_buf(),
        })
    }

    pub fn attempts(&self, epic: u32) -> u32 {
        self.retries.get(&epic).copied().unwrap_or(0)
    }
}

/// How one `execute_epic` call resolved.
#[derive(Debug)]
pub enum EpicRunResult {
    Completed(AgentOutcome),
    /// Recovery wants the same epic attempted again.
    Retryable,
    /// Recovery wants the Environment epic re-run first.
    DependencyRecovery,
    Skipped,
    /// Escalated; the pipeline blocks.
    Halted,
}

/// Per-epic execution seam. The production runner invokes agents (and the
/// workflow engine for the Execution epic); tests script outcomes.
#[async_trait]
pub trait EpicRunner: Send {
    async fn run_epic(&mut self, epic: &EpicDef, run: &PipelineRun) -> anyhow::Result<AgentOutcome>;
}

/// The orchestrating state machine for one work item.
pub struct Pipeline {
    run: PipelineRun,
    path: PathBuf,
    project_dir: PathBuf,
    settings: ConductorToml,
    recovery: RecoveryHandler,
    rollback: Box<dyn RollbackCollaborator + Send>,
    events: Arc<Mutex<EventBus>>,
}

impl Pipeline {
    pub fn new(config: &Config, settings: ConductorToml, work_item_id: &str) -> Self {
        Self {
            run: PipelineRun::fresh(work_item_id),
            path: config.run_record_path(work_item_id),
            project_dir: config.project_dir.clone(),
            recovery: RecoveryHandler::new(config),
            rollback: Box::new(NoRollback),
            settings,
            events: Arc::new(Mutex::new(EventBus::new())),
        }
    }

    pub fn with_rollback(mut self, rollback: Box<dyn RollbackCollaborator + Send>) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_events(mut self, events: Arc<Mutex<EventBus>>) -> Self {
        self.events = events;
        self
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    pub fn state(&self) -> PipelineState {
        self.run.status
    }

    /// Load-and-merge any resumable persisted run, run the tech-stack
    /// pre-flight, and become `Ready`.
    pub fn initialize(&mut self) -> Result<(), PipelineError> {
        if self.path.exists() {
            match PipelineRun::load(&self.path) {
                Ok(persisted) => {
                    let age = Utc::now().signed_duration_since(persisted.updated_at);
                    if age > chrono::Duration::hours(RESUME_STALENESS_HOURS) {
                        info!(
                            work_item = %self.run.work_item_id,
                            age_hours = age.num_hours(),
                            "persisted run is stale, starting fresh"
                        );
                    } else if persisted.definition_fingerprint != self.run.definition_fingerprint {
                        info!(
                            work_item = %self.run.work_item_id,
                            "pipeline definition changed since the run was saved, starting fresh"
                        );
                    } else {
                        info!(
                            work_item = %self.run.work_item_id,
                            workflow_id = %persisted.workflow_id,
                            "resuming persisted run"
                        );
                        self.merge_persisted(persisted);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "persisted run is unusable, starting fresh");
                }
            }
        }

        let profile = detect_project(&self.project_dir);
        info!(environment = %profile.summary(), "pre-flight complete");
        self.run.environment = Some(profile);

        self.transition(PipelineState::Ready);
        self.persist()
    }

    /// Deep-merge: persisted epic records and retry counters replace the
    /// fresh defaults where present; epics the current definition does not
    /// know are dropped with a warning.
    fn merge_persisted(&mut self, persisted: PipelineRun) {
        for (number, record) in persisted.epics {
            if self.run.epics.contains_key(&number) {
                self.run.epics.insert(number, record);
            } else {
                warn!(epic = number, "persisted epic not in the current definition, dropped");
            }
        }
        self.run.retries.extend(persisted.retries);
        self.run.workflow_id = persisted.workflow_id;
        self.run.started_at = persisted.started_at;
        self.run.error_log = persisted.error_log;
    }

    /// Walk the epic sequence to completion or a block.
    pub async fn execute_full_pipeline(
        &mut self,
        runner: &mut dyn EpicRunner,
    ) -> Result<PipelineState, PipelineError> {
        if !matches!(self.run.status, PipelineState::Ready | PipelineState::InProgress) {
            return Err(PipelineError::NotRunnable {
                work_item: self.run.work_item_id.clone(),
                state: self.run.status.to_string(),
            });
        }
        self.transition(PipelineState::InProgress);
        self.persist()?;

        let flags = self.project_flags();
        let last_epic = EPIC_TABLE.last().map(|d| d.number).unwrap_or(0);

        for def in &EPIC_TABLE {
            let number = def.number;
            if self.epic_status(number) == EpicStatus::Completed {
                info!(epic = number, name = def.name, "already completed, skipping");
                continue;
            }

            let settings = self.settings.epic_settings(number as u8, def.slug);
            if let Some(expr) = &settings.skip_when {
                if def.critical {
                    warn!(epic = number, "skip condition on a critical epic is ignored");
                } else if condition::eval(expr, &flags).unwrap_or(false) {
                    info!(epic = number, condition = %expr, "skip condition met");
                    self.mark_skipped(number)?;
                    continue;
                }
            }

            loop {
                match self.execute_epic(number, runner).await? {
                    EpicRunResult::Completed(outcome) => {
                        if number == last_epic {
                            break;
                        }
                        let verdict = gate::evaluate(&outcome, settings.pass_threshold);
                        self.publish(PipelineEvent::GateEvaluated {
                            epic: number,
                            verdict: verdict.slug().to_string(),
                            confidence: outcome.confidence,
                        });
                        match verdict {
                            GateVerdict::Pass => break,
                            GateVerdict::Blocked => {
                                warn!(epic = number, "quality gate blocked the pipeline");
                                self.mark_gate_failure(number, verdict);
                                return self.block();
                            }
                            GateVerdict::NeedsRevision => {
                                if self.run.attempts(number) < settings.max_retries {
                                    info!(epic = number, "gate verdict needs revision, re-attempting");
                                    continue;
                                }
                                warn!(epic = number, "revision attempts exhausted");
                                self.mark_gate_failure(number, verdict);
                                return self.block();
                            }
                        }
                    }
                    EpicRunResult::Retryable => {
                        if self.run.attempts(number) < settings.max_retries {
                            continue;
                        }
                        warn!(epic = number, "retry budget exhausted");
                        return self.block();
                    }
                    EpicRunResult::DependencyRecovery => {
                        info!(epic = number, "re-provisioning the environment before retrying");
                        if let EpicRunResult::Halted = self.execute_epic(2, runner).await? {
                            return self.block();
                        }
                        if self.run.attempts(number) < settings.max_retries {
                            continue;
                        }
                        return self.block();
                    }
                    EpicRunResult::Skipped => break,
                    EpicRunResult::Halted => return self.block(),
                }
            }
        }

        self.transition(PipelineState::Complete);
        self.persist()?;
        Ok(self.run.status)
    }

    /// Run one epic attempt, consulting recovery on failure.
    pub async fn execute_epic(
        &mut self,
        number: u32,
        runner: &mut dyn EpicRunner,
    ) -> Result<EpicRunResult, PipelineError> {
        let def = epic_def(number).ok_or(PipelineError::UnknownEpic { number })?;

        let attempt = {
            let counter = self.run.retries.entry(number).or_insert(0);
            *counter += 1;
            *counter
        };
        if let Some(record) = self.run.epics.get_mut(&number) {
            record.status = EpicStatus::InProgress;
        }
        self.run.updated_at = Utc::now();
        self.publish(PipelineEvent::EpicStarted {
            number,
            name: def.name.to_string(),
            attempt,
        });

        match runner.run_epic(def, &self.run).await {
            Ok(outcome) => {
                if let Some(record) = self.run.epics.get_mut(&number) {
                    record.status = EpicStatus::Completed;
                    record.completed_at = Some(Utc::now());
                    record.result = serde_json::to_value(&outcome).ok();
                    record.error = None;
                }
                self.publish(PipelineEvent::EpicCompleted {
                    number,
                    name: def.name.to_string(),
                    status: "completed".to_string(),
                });
                self.persist()?;
                Ok(EpicRunResult::Completed(outcome))
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.run.error_log.push(format!("epic {}: {}", number, message));
                if let Some(record) = self.run.epics.get_mut(&number) {
                    record.status = EpicStatus::Failed;
                    record.error = Some(message.clone());
                }

                let settings = self.settings.epic_settings(number as u8, def.slug);
                let ctx = FailureContext {
                    epic_name: def.name.to_string(),
                    critical: def.critical,
                    subtask_id: format!("epic-{}", number),
                    max_retries: settings.max_retries,
                    auto_escalate: settings.auto_escalate,
                };
                let decision =
                    self.recovery
                        .handle_failure(number, &message, &ctx, self.rollback.as_mut());
                let error_class = self
                    .recovery
                    .attempts(number)
                    .last()
                    .map(|a| a.class.to_string())
                    .unwrap_or_default();
                self.publish(PipelineEvent::RecoverySelected {
                    epic: number,
                    strategy: decision.strategy.to_string(),
                    error_class,
                });
                if let Some(report) = &decision.report {
                    self.publish(PipelineEvent::Escalated {
                        epic: number,
                        report_path: report.display().to_string(),
                    });
                }
                self.persist()?;

                match decision.strategy {
                    RecoveryStrategy::RetrySame | RecoveryStrategy::RollbackAndRetry => {
                        Ok(EpicRunResult::Retryable)
                    }
                    RecoveryStrategy::TriggerDependencyRecovery => {
                        Ok(EpicRunResult::DependencyRecovery)
                    }
                    RecoveryStrategy::Skip => {
                        self.mark_skipped(number)?;
                        Ok(EpicRunResult::Skipped)
                    }
                    RecoveryStrategy::Escalate => Ok(EpicRunResult::Halted),
                }
            }
        }
    }

    /// Clear epic statuses from `from` onward and force the run back to a
    /// runnable state. This is an explicit operator action and the one place
    /// allowed to leave `Complete`.
    pub fn resume_from_epic(&mut self, from: u32) -> Result<(), PipelineError> {
        if epic_def(from).is_none() {
            return Err(PipelineError::UnknownEpic { number: from });
        }
        for (_, record) in self.run.epics.range_mut(from..) {
            record.status = EpicStatus::Pending;
            record.completed_at = None;
            record.result = None;
            record.error = None;
        }
        self.run.retries.retain(|number, _| *number < from);
        if self.run.status != PipelineState::Ready {
            info!(
                work_item = %self.run.work_item_id,
                from_state = %self.run.status,
                from_epic = from,
                "operator reset to Ready"
            );
            self.run.status = PipelineState::Ready;
        }
        self.run.updated_at = Utc::now();
        self.persist()
    }

    /// A gate rejection un-completes the epic so a resumed run re-attempts
    /// it instead of skipping past the unresolved block.
    fn mark_gate_failure(&mut self, number: u32, verdict: GateVerdict) {
        if let Some(record) = self.run.epics.get_mut(&number) {
            record.status = EpicStatus::Failed;
            record.completed_at = None;
            record.error = Some(format!("quality gate verdict: {}", verdict));
        }
    }

    fn block(&mut self) -> Result<PipelineState, PipelineError> {
        self.transition(PipelineState::Blocked);
        self.persist()?;
        Ok(self.run.status)
    }

    fn mark_skipped(&mut self, number: u32) -> Result<(), PipelineError> {
        let name = if let Some(record) = self.run.epics.get_mut(&number) {
            record.status = EpicStatus::Skipped;
            record.completed_at = Some(Utc::now());
            record.name.clone()
        } else {
            return Err(PipelineError::UnknownEpic { number });
        };
        self.publish(PipelineEvent::EpicCompleted {
            number,
            name,
            status: "skipped".to_string(),
        });
        self.persist()
    }

    fn epic_status(&self, number: u32) -> EpicStatus {
        self.run
            .epics
            .get(&number)
            .map(|r| r.status)
            .unwrap_or(EpicStatus::Pending)
    }

    /// Flag set for skip conditions: detected stacks and environment traits.
    fn project_flags(&self) -> HashMap<String, bool> {
        let mut flags = HashMap::new();
        if let Some(profile) = &self.run.environment {
            flags.insert("has_git".to_string(), profile.has_git);
            flags.insert("has_ci".to_string(), profile.has_ci);
            flags.insert("has_docker".to_string(), profile.has_docker);
            flags.insert("has_tests".to_string(), profile.has_tests);
            for stack in &profile.stacks {
                flags.insert(stack.clone(), true);
            }
            for language in &profile.languages {
                flags.insert(language.clone(), true);
            }
        }
        flags.insert("healing".to_string(), self.settings.healing.enabled);
        flags
    }

    /// Apply a transition if the table allows it; log and ignore otherwise.
    fn transition(&mut self, to: PipelineState) {
        let from = self.run.status;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, work_item = %self.run.work_item_id, "illegal pipeline transition ignored");
            return;
        }
        self.run.status = to;
        self.run.updated_at = Utc::now();
        self.publish(PipelineEvent::PipelineStateChanged {
            work_item: self.run.work_item_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    fn persist(&self) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::PersistFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(&self.run)
            .map_err(|e| PipelineError::Other(anyhow::Error::new(e)))?;
        std::fs::write(&self.path, json).map_err(|source| PipelineError::PersistFailed {
            path: self.path.clone(),
            source,
        })
    }

    fn publish(&self, event: PipelineEvent) {
        if let Ok(mut bus) = self.events.lock() {
            bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    /// Scripted epic runner: per-epic queues of outcomes; exhausted queues
    /// succeed with high confidence.
    #[derive(Default)]
    struct ScriptedRunner {
        script: HashMap<u32, VecDeque<Result<AgentOutcome, String>>>,
        calls: Vec<u32>,
    }

    impl ScriptedRunner {
        fn with(mut self, epic: u32, results: Vec<Result<AgentOutcome, String>>) -> Self {
            self.script.insert(epic, results.into());
            self
        }
    }

    #[async_trait]
    impl EpicRunner for ScriptedRunner {
        async fn run_epic(
            &mut self,
            epic: &EpicDef,
            _run: &PipelineRun,
        ) -> anyhow::Result<AgentOutcome> {
            self.calls.push(epic.number);
            match self.script.get_mut(&epic.number).and_then(|q| q.pop_front()) {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(message)) => anyhow::bail!(message),
                None => Ok(good(95)),
            }
        }
    }

    fn good(confidence: u8) -> AgentOutcome {
        AgentOutcome {
            summary: "done".into(),
            confidence: Some(confidence),
            files_modified: Vec::new(),
            blocking: false,
        }
    }

    fn blocking_outcome() -> AgentOutcome {
        AgentOutcome {
            blocking: true,
            ..good(95)
        }
    }

    fn fixture(dir: &std::path::Path) -> Config {
        let config = Config::new(dir.to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        config
    }

    fn pipeline(config: &Config) -> Pipeline {
        Pipeline::new(config, ConductorToml::default(), "feature-1")
    }

    #[tokio::test]
    async fn test_full_pipeline_completes_all_epics() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default();
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        assert_eq!(state, PipelineState::Complete);
        assert_eq!(runner.calls, vec![1, 2, 3, 4, 5]);
        assert!(p.run().epics.values().all(|r| r.status == EpicStatus::Completed));

        let persisted = PipelineRun::load(&config.run_record_path("feature-1")).unwrap();
        assert_eq!(persisted.status, PipelineState::Complete);
    }

    #[tokio::test]
    async fn test_execute_requires_ready_or_in_progress() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        // Never initialized: still Initialized.
        let err = p
            .execute_full_pipeline(&mut ScriptedRunner::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotRunnable { .. }));
    }

    #[test]
    fn test_illegal_transition_is_ignored_not_fatal() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);

        p.transition(PipelineState::Complete); // Initialized -> Complete: illegal
        assert_eq!(p.state(), PipelineState::Initialized);

        p.transition(PipelineState::Ready);
        p.transition(PipelineState::InProgress);
        p.transition(PipelineState::Ready); // InProgress -> Ready: illegal
        assert_eq!(p.state(), PipelineState::InProgress);
        p.transition(PipelineState::Complete);
        assert_eq!(p.state(), PipelineState::Complete);
        p.transition(PipelineState::InProgress); // Complete is terminal
        assert_eq!(p.state(), PipelineState::Complete);
    }

    #[tokio::test]
    async fn test_blocking_gate_verdict_halts_without_advancing() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default().with(1, vec![Ok(blocking_outcome())]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        assert_eq!(state, PipelineState::Blocked);
        assert_eq!(runner.calls, vec![1]);
        assert_eq!(p.run().epics[&2].status, EpicStatus::Pending);
    }

    #[tokio::test]
    async fn test_needs_revision_reattempts_in_place() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        // First attempt below the 70 threshold, second passes.
        let mut runner = ScriptedRunner::default().with(1, vec![Ok(good(50)), Ok(good(90))]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        assert_eq!(state, PipelineState::Complete);
        assert_eq!(p.run().attempts(1), 2);
    }

    #[tokio::test]
    async fn test_needs_revision_blocks_when_retries_exhausted() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default()
            .with(1, vec![Ok(good(10)), Ok(good(10)), Ok(good(10)), Ok(good(10))]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        assert_eq!(state, PipelineState::Blocked);
        assert_eq!(p.run().attempts(1), 3); // default max_retries
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default()
            .with(2, vec![Err("connection refused".into()), Ok(good(95))]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        assert_eq!(state, PipelineState::Complete);
        assert_eq!(p.run().attempts(2), 2);
        assert!(p.run().error_log.iter().any(|e| e.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_and_block() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default().with(
            1,
            vec![
                Err("timeout one".into()),
                Err("timeout two".into()),
                Err("timeout three".into()),
            ],
        );
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        assert_eq!(state, PipelineState::Blocked);
        // The third attempt hit the retry ceiling and escalated.
        let reports: Vec<_> = std::fs::read_dir(&config.escalations_dir)
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn test_configuration_failure_skips_non_critical_epic() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default()
            .with(5, vec![Err("missing config for publish target".into())]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        // Publication is non-critical: skipped, pipeline still completes.
        assert_eq!(state, PipelineState::Complete);
        assert_eq!(p.run().epics[&5].status, EpicStatus::Skipped);
    }

    #[tokio::test]
    async fn test_dependency_failure_reruns_environment_epic() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default()
            .with(3, vec![Err("cannot find module 'db-migrate'".into()), Ok(good(95))]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        // Environment ran twice: once in sequence, once as dependency recovery.
        assert_eq!(state, PipelineState::Complete);
        assert_eq!(runner.calls, vec![1, 2, 3, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_environment_rerun_escalation_blocks() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = ScriptedRunner::default()
            .with(3, vec![Err("cannot find module 'db-migrate'".into())])
            .with(2, vec![Ok(good(95)), Err("panic: agent crashed".into())]);
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();

        // The re-provisioning run itself escalated; the pipeline parks
        // instead of retrying the Execution epic against a broken environment.
        assert_eq!(state, PipelineState::Blocked);
        assert_eq!(runner.calls, vec![1, 2, 3, 2]);
    }

    /// Fails the Execution epic with a dependency error, then wrecks the run
    /// record path when the environment re-provisioning run starts, so the
    /// save inside that re-run fails.
    struct RecordWreckingRunner {
        record_path: PathBuf,
        env_visits: u32,
    }

    #[async_trait]
    impl EpicRunner for RecordWreckingRunner {
        async fn run_epic(
            &mut self,
            epic: &EpicDef,
            _run: &PipelineRun,
        ) -> anyhow::Result<AgentOutcome> {
            match epic.number {
                2 => {
                    self.env_visits += 1;
                    if self.env_visits == 2 {
                        std::fs::remove_file(&self.record_path).ok();
                        std::fs::create_dir_all(&self.record_path).unwrap();
                    }
                    Ok(good(95))
                }
                3 => anyhow::bail!("cannot find module 'db-migrate'"),
                _ => Ok(good(95)),
            }
        }
    }

    #[tokio::test]
    async fn test_environment_rerun_persist_failure_propagates() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();

        let mut runner = RecordWreckingRunner {
            record_path: config.run_record_path("feature-1"),
            env_visits: 0,
        };
        let err = p.execute_full_pipeline(&mut runner).await.unwrap_err();
        assert!(matches!(err, PipelineError::PersistFailed { .. }));
    }

    #[tokio::test]
    async fn test_round_trip_resume_skips_completed_epics() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());

        // First process: blocks on epic 3.
        let mut first = pipeline(&config);
        first.initialize().unwrap();
        let mut runner = ScriptedRunner::default().with(3, vec![Ok(blocking_outcome())]);
        assert_eq!(
            first.execute_full_pipeline(&mut runner).await.unwrap(),
            PipelineState::Blocked
        );
        let saved_workflow_id = first.run().workflow_id.clone();
        let saved_retries = first.run().retries.clone();

        // Second process: load, merge, resume. Epics 1-2 must not re-run.
        let mut second = pipeline(&config);
        second.initialize().unwrap();
        assert_eq!(second.run().workflow_id, saved_workflow_id);
        assert_eq!(second.run().retries, saved_retries);

        let mut resumed_runner = ScriptedRunner::default();
        let state = second.execute_full_pipeline(&mut resumed_runner).await.unwrap();
        assert_eq!(state, PipelineState::Complete);
        assert_eq!(resumed_runner.calls, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stale_run_is_not_auto_resumed() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());

        let mut first = pipeline(&config);
        first.initialize().unwrap();
        first
            .execute_full_pipeline(&mut ScriptedRunner::default())
            .await
            .unwrap();

        // Age the record past the staleness window.
        let path = config.run_record_path("feature-1");
        let mut run = PipelineRun::load(&path).unwrap();
        run.updated_at = Utc::now() - chrono::Duration::hours(25);
        std::fs::write(&path, serde_json::to_string_pretty(&run).unwrap()).unwrap();

        let mut second = pipeline(&config);
        second.initialize().unwrap();
        // Fresh run: nothing completed, new workflow id.
        assert_ne!(second.run().workflow_id, run.workflow_id);
        assert!(second.run().epics.values().all(|r| r.status == EpicStatus::Pending));
    }

    #[tokio::test]
    async fn test_changed_definition_is_not_auto_resumed() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());

        let mut first = pipeline(&config);
        first.initialize().unwrap();
        first
            .execute_full_pipeline(&mut ScriptedRunner::default())
            .await
            .unwrap();

        let path = config.run_record_path("feature-1");
        let mut run = PipelineRun::load(&path).unwrap();
        run.definition_fingerprint = "deadbeef".to_string();
        std::fs::write(&path, serde_json::to_string_pretty(&run).unwrap()).unwrap();

        let mut second = pipeline(&config);
        second.initialize().unwrap();
        assert!(second.run().epics.values().all(|r| r.status == EpicStatus::Pending));
    }

    #[tokio::test]
    async fn test_corrupt_record_starts_fresh() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let path = config.run_record_path("feature-1");
        std::fs::write(&path, "{\"workflow_id\": \"x\"}").unwrap();

        // Invalid on direct load.
        assert!(matches!(
            PipelineRun::load(&path),
            Err(PipelineError::InvalidRunRecord { .. })
        ));

        // initialize() shrugs and starts fresh.
        let mut p = pipeline(&config);
        p.initialize().unwrap();
        assert_eq!(p.state(), PipelineState::Ready);
    }

    #[tokio::test]
    async fn test_resume_from_epic_clears_later_epics() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        p.initialize().unwrap();
        p.execute_full_pipeline(&mut ScriptedRunner::default())
            .await
            .unwrap();
        assert_eq!(p.state(), PipelineState::Complete);

        p.resume_from_epic(4).unwrap();
        assert_eq!(p.state(), PipelineState::Ready);
        assert_eq!(p.run().epics[&3].status, EpicStatus::Completed);
        assert_eq!(p.run().epics[&4].status, EpicStatus::Pending);
        assert_eq!(p.run().epics[&5].status, EpicStatus::Pending);
        assert_eq!(p.run().attempts(4), 0);
        assert_eq!(p.run().attempts(3), 1);

        let mut runner = ScriptedRunner::default();
        let state = p.execute_full_pipeline(&mut runner).await.unwrap();
        assert_eq!(state, PipelineState::Complete);
        assert_eq!(runner.calls, vec![4, 5]);
    }

    #[test]
    fn test_resume_from_unknown_epic_is_an_error() {
        let dir = tempdir().unwrap();
        let config = fixture(dir.path());
        let mut p = pipeline(&config);
        assert!(matches!(
            p.resume_from_epic(9),
            Err(PipelineError::UnknownEpic { number: 9 })
        ));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(definition_fingerprint(), definition_fingerprint());
        assert_eq!(definition_fingerprint().len(), 64);
    }

    #[test]
    fn test_epic_table_shape() {
        assert_eq!(EPIC_TABLE.len(), 5);
        let critical: Vec<u32> = EPIC_TABLE
            .iter()
            .filter(|d| d.critical)
            .map(|d| d.number)
            .collect();
        assert_eq!(critical, vec![1, 3, 4]);
        // Execution resolves its agent per work item.
        assert!(epic_def(3).unwrap().agent.is_none());
    }
}
