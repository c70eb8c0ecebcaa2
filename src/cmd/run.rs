//! `conductor run`, `conductor resume`, and `conductor decide`.
//!
//! `run` and `resume` share one path: acquire the orchestration lock, build
//! the event bus and UI, then drive the pipeline with the production epic
//! runner. Fixed-agent epics go straight to the agent process; the Execution
//! epic loops the planned work items through the workflow engine.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use console::style;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use conductor::assignment::AgentId;
use conductor::checkpoint::CheckpointManager;
use conductor::conductor_config::ConductorToml;
use conductor::config::Config;
use conductor::context::{ContextAccumulator, ContextTarget, WorkItemSummary};
use conductor::detect::detect_project;
use conductor::events::{EventBus, LogSink, StatusFileSink};
use conductor::executor::process::{CommandAnalysis, ProcessExecutor};
use conductor::executor::{AgentExecutor, AgentOutcome, AgentTask, execute_with_timeout};
use conductor::lock::{AcquireOutcome, LockManager};
use conductor::pipeline::{EPIC_TABLE, EpicDef, EpicRunner, Pipeline, PipelineRun, PipelineState};
use conductor::plan::{PlanItem, WorkPlan};
use conductor::router::{self, Route};
use conductor::session::{
    ActionType, ContextSnapshotPatch, EpicInfo, LastAction, ProgressPatch, SessionPatch,
    SessionStore,
};
use conductor::ui::{CheckpointPrompt, ConductorUI, UiSink};
use conductor::workflow::{
    CheckpointDecision, ItemOutcome, ItemRun, StaticAnalysis, WorkItem, WorkflowEngine,
};

use crate::Cli;

/// The single mutual-exclusion resource for a project's orchestration.
const ORCHESTRATION_LOCK: &str = "orchestration";
const LOCK_TTL_SECS: u64 = 3600;

pub async fn cmd_run(cli: &Cli, project_dir: std::path::PathBuf) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose)?;

    let route = router::route(&config);
    match route {
        Route::Onboard | Route::Adopt => {
            bail!("{}. Run `conductor init` first.", route.describe());
        }
        Route::Start | Route::Resume { .. } => {
            println!("{} {}", style("→").cyan(), route.describe());
            if let Route::Resume { crashed: true } = route {
                println!(
                    "{} previous session looks crashed; completed work will be skipped",
                    style("!").yellow().bold()
                );
            }
        }
    }

    orchestrate(cli, &config, None).await
}

pub async fn cmd_resume(
    cli: &Cli,
    project_dir: std::path::PathBuf,
    from_epic: Option<u32>,
) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose)?;
    let store = SessionStore::new(&config);
    if !store.exists() && !config.runs_dir.exists() {
        bail!("Nothing to resume here. Run `conductor run` to start a pipeline.");
    }
    orchestrate(cli, &config, from_epic).await
}

/// Shared run/resume path, under the orchestration lock.
async fn orchestrate(cli: &Cli, config: &Config, resume_from: Option<u32>) -> Result<()> {
    let settings = ConductorToml::load_or_default(&config.settings_file)
        .map_err(anyhow::Error::new)
        .context("Failed to load conductor.toml")?;
    for warning in settings.warnings() {
        println!("{} {}", style("warning:").yellow().bold(), warning);
    }
    let plan = WorkPlan::load(config)?;

    let locks = LockManager::new(&config.locks_dir);
    let swept = locks.cleanup_stale_locks()?;
    if swept > 0 {
        info!(swept, "removed stale locks before starting");
    }
    match locks
        .acquire(ORCHESTRATION_LOCK, LOCK_TTL_SECS, &plan.epic_id)
        .await?
    {
        AcquireOutcome::Acquired => {}
        AcquireOutcome::Contended { holder_pid, owner } => {
            bail!(
                "Another orchestration ('{}', pid {}) holds the lock. \
                 Wait for it or run `conductor locks cleanup` if it crashed.",
                owner,
                holder_pid
            );
        }
    }

    let result = run_pipeline(cli, config, settings, plan, resume_from).await;
    if let Err(e) = locks.release(ORCHESTRATION_LOCK) {
        warn!(error = %e, "failed to release the orchestration lock");
    }
    result
}

async fn run_pipeline(
    cli: &Cli,
    config: &Config,
    settings: ConductorToml,
    plan: WorkPlan,
    resume_from: Option<u32>,
) -> Result<()> {
    let store = SessionStore::new(config);
    if !store.exists() {
        let branch = CheckpointManager::new(&config.project_dir)
            .ok()
            .and_then(|cm| cm.current_branch());
        store.create(
            EpicInfo {
                epic_id: plan.epic_id.clone(),
                epic_title: plan.epic_title.clone(),
                items: plan.item_ids(),
            },
            branch,
        )?;
    }

    let ui = Arc::new(ConductorUI::new(EPIC_TABLE.len() as u64, config.verbose));
    ui.print_run_header(&plan.epic_id, &detect_project(&config.project_dir).summary());

    let mut bus = EventBus::new();
    bus.register(Box::new(LogSink));
    bus.register(Box::new(StatusFileSink::new(&config.status_file)));
    bus.register(Box::new(UiSink::new(ui.clone())));
    let events = Arc::new(Mutex::new(bus));

    let executor: Arc<dyn AgentExecutor> = Arc::new(ProcessExecutor::new(&config.project_dir));
    let analysis: Arc<dyn StaticAnalysis> = Arc::new(CommandAnalysis::new(&config.project_dir));

    let mut runner = EpicAgents {
        config: config.clone(),
        settings: settings.clone(),
        plan: plan.clone(),
        executor,
        analysis,
        events: events.clone(),
        assume_continue: cli.yes,
        timeout: Duration::from_secs(settings.defaults.agent_timeout_secs),
    };

    let mut pipeline = Pipeline::new(config, settings, &plan.epic_id).with_events(events.clone());
    if let Ok(checkpoints) = CheckpointManager::new(&config.project_dir) {
        pipeline = pipeline.with_rollback(Box::new(checkpoints));
    } else {
        info!("no git repository found, rollback support disabled");
    }

    pipeline.initialize()?;
    if let Some(from) = resume_from {
        pipeline.resume_from_epic(from)?;
    }

    let final_state = pipeline.execute_full_pipeline(&mut runner).await?;
    ui.finish(&final_state.to_string());

    match final_state {
        PipelineState::Complete => {
            println!(
                "\n{} Epic '{}' complete.",
                style("✓").green().bold(),
                plan.epic_id
            );
        }
        other => {
            println!(
                "\n{} Pipeline stopped in state {}. See `conductor status` for details.",
                style("✗").red().bold(),
                style(other).red()
            );
        }
    }
    Ok(())
}

pub async fn cmd_decide(
    cli: &Cli,
    project_dir: std::path::PathBuf,
    item: &str,
    decision: &str,
) -> Result<()> {
    let config = Config::new(project_dir, cli.verbose)?;
    let decision = CheckpointDecision::from_str(decision).map_err(|e| anyhow::anyhow!(e))?;
    let settings = ConductorToml::load_or_default(&config.settings_file)
        .map_err(anyhow::Error::new)
        .context("Failed to load conductor.toml")?;

    let mut bus = EventBus::new();
    bus.register(Box::new(LogSink));
    bus.register(Box::new(StatusFileSink::new(&config.status_file)));
    let events = Arc::new(Mutex::new(bus));

    let executor: Arc<dyn AgentExecutor> = Arc::new(ProcessExecutor::new(&config.project_dir));
    let analysis: Arc<dyn StaticAnalysis> = Arc::new(CommandAnalysis::new(&config.project_dir));
    let mut engine = WorkflowEngine::new(&config, &settings, executor, analysis)
        .with_events(events)
        .with_session(SessionStore::new(&config));

    let outcome = engine.resume_with_decision(item, decision)?;
    let store = SessionStore::new(&config);
    match outcome {
        ItemOutcome::Completed => {
            if let Ok(state) = store.load() {
                store.update(
                    SessionPatch::default()
                        .progress(ProgressPatch::complete_item(&state.progress, item))
                        .last_action(LastAction::now(ActionType::ItemCompleted).with_item(item)),
                )?;
            }
            println!(
                "{} Item '{}' completed. Run `conductor resume` to continue the pipeline.",
                style("✓").green().bold(),
                item
            );
        }
        ItemOutcome::WaitingForInput => {
            println!("Item '{}' is parked again, waiting for a decision.", item);
        }
        ItemOutcome::Paused => {
            let _ = store.update(
                SessionPatch::default()
                    .last_action(LastAction::now(ActionType::Pause).with_item(item)),
            );
            println!("Run paused at item '{}'.", item);
        }
        ItemOutcome::Aborted => {
            let _ = store.update(
                SessionPatch::default()
                    .last_action(LastAction::now(ActionType::Abort).with_item(item)),
            );
            println!("Run aborted at item '{}'.", item);
        }
    }
    Ok(())
}

/// Production epic runner: fixed agents for epics that name one, the
/// workflow engine for the per-item Execution epic.
struct EpicAgents {
    config: Config,
    settings: ConductorToml,
    plan: WorkPlan,
    executor: Arc<dyn AgentExecutor>,
    analysis: Arc<dyn StaticAnalysis>,
    events: Arc<Mutex<EventBus>>,
    assume_continue: bool,
    timeout: Duration,
}

#[async_trait]
impl EpicRunner for EpicAgents {
    async fn run_epic(&mut self, epic: &EpicDef, run: &PipelineRun) -> Result<AgentOutcome> {
        match epic.agent {
            Some(agent) => self.run_fixed_epic(epic, run, agent).await,
            None => self.run_execution_epic().await,
        }
    }
}

impl EpicAgents {
    async fn run_fixed_epic(
        &self,
        epic: &EpicDef,
        run: &PipelineRun,
        agent: &str,
    ) -> Result<AgentOutcome> {
        let environment = run
            .environment
            .as_ref()
            .map(|profile| profile.summary())
            .unwrap_or_else(|| "unknown".to_string());
        let items: Vec<String> = self
            .plan
            .items
            .iter()
            .map(|item| format!("- {} ({})", item.title, item.id))
            .collect();
        let description = match epic.slug {
            "specification" => format!(
                "Write or refine the specification for epic '{}': {}.\nPlanned items:\n{}",
                self.plan.epic_id,
                self.plan.epic_title,
                items.join("\n")
            ),
            "environment" => format!(
                "Prepare the development environment for '{}' (detected: {}). \
                 Install missing toolchains and dependencies, make the test suite runnable.",
                self.plan.epic_id, environment
            ),
            "quality" => format!(
                "Run a full quality pass over the completed work for '{}': \
                 tests, lint, and a review of every item.",
                self.plan.epic_id
            ),
            "publication" => format!(
                "Publish the completed work for '{}': final commit, changelog, \
                 and any release steps the project defines.",
                self.plan.epic_id
            ),
            other => format!("Carry out the {} stage for '{}'.", other, self.plan.epic_id),
        };

        let task = AgentTask::new(
            format!("{}-epic-{}", self.plan.epic_id, epic.number),
            description,
        )
        .for_phase(epic.slug);
        execute_with_timeout(
            self.executor.as_ref(),
            &AgentId::new(agent),
            &task,
            "",
            self.timeout,
        )
        .await
    }

    /// Loop the pending work items through the workflow engine, carrying
    /// token-bounded context assembled from the completed ones.
    async fn run_execution_epic(&mut self) -> Result<AgentOutcome> {
        let store = SessionStore::new(&self.config);
        let mut engine = WorkflowEngine::new(
            &self.config,
            &self.settings,
            self.executor.clone(),
            self.analysis.clone(),
        )
        .with_events(self.events.clone())
        .with_session(SessionStore::new(&self.config))
        .with_decisions(Box::new(CheckpointPrompt::new(self.assume_continue)));
        let accumulator = ContextAccumulator::new(&self.settings.context);

        loop {
            let state = store.load().map_err(anyhow::Error::new)?;
            let Some(item_id) = state.progress.pending.first().cloned() else {
                break;
            };
            let Some(plan_item) = self.plan.item(&item_id) else {
                bail!(
                    "Session tracks item '{}' but the plan does not define it",
                    item_id
                );
            };
            let work_item =
                WorkItem::new(&plan_item.id, &plan_item.title, &plan_item.description)
                    .auto_assign();

            let summaries = completed_summaries(&self.config, &self.plan, &state.progress.done);
            let target = ContextTarget {
                files_to_modify: Vec::new(),
                executor: work_item.assignment.as_ref().map(|a| a.executor.clone()),
            };
            let context = accumulator.build_context(
                &self.plan.epic_id,
                summaries.len(),
                &summaries,
                &target,
            );

            store
                .update(
                    SessionPatch::default()
                        .progress(ProgressPatch {
                            current_item: Some(Some(item_id.clone())),
                            ..ProgressPatch::default()
                        })
                        .last_action(LastAction::now(ActionType::ItemStarted).with_item(&item_id)),
                )
                .map_err(anyhow::Error::new)?;

            match engine.run_item(&work_item, &context.text).await? {
                ItemOutcome::Completed => {
                    let summary = item_summary(&self.config, plan_item);
                    let state = store.load().map_err(anyhow::Error::new)?;
                    let mut patch = SessionPatch::default()
                        .progress(ProgressPatch::complete_item(&state.progress, &item_id))
                        .last_action(
                            LastAction::now(ActionType::ItemCompleted).with_item(&item_id),
                        );
                    if let Some(summary) = &summary {
                        patch = patch.context_snapshot(ContextSnapshotPatch {
                            files_touched: Some(summary.files_modified.clone()),
                            executor_increment: summary
                                .executor
                                .as_ref()
                                .map(|id| id.to_string()),
                            branch: None,
                        });
                    }
                    store.update(patch).map_err(anyhow::Error::new)?;
                }
                ItemOutcome::WaitingForInput => {
                    return Ok(AgentOutcome {
                        summary: format!(
                            "item '{}' is parked at its checkpoint; answer it with \
                             `conductor decide {} <continue|pause|review|abort>`",
                            item_id, item_id
                        ),
                        blocking: true,
                        ..AgentOutcome::default()
                    });
                }
                ItemOutcome::Paused => {
                    return Ok(AgentOutcome {
                        summary: format!("run paused at item '{}'", item_id),
                        blocking: true,
                        ..AgentOutcome::default()
                    });
                }
                ItemOutcome::Aborted => {
                    bail!("run aborted at the checkpoint for item '{}'", item_id);
                }
            }
        }

        let state = store.load().map_err(anyhow::Error::new)?;
        let summaries = completed_summaries(&self.config, &self.plan, &state.progress.done);
        // Every item already passed its own reviewer; the epic-level gate
        // sees the weakest of those verdicts.
        let confidence = summaries
            .iter()
            .filter_map(|s| s.confidence)
            .min()
            .or(Some(100));
        Ok(AgentOutcome {
            summary: format!("{} work items completed", state.progress.done.len()),
            confidence,
            files_modified: state.context_snapshot.files_touched.clone(),
            blocking: false,
        })
    }

}

pub(crate) fn completed_summaries(
    config: &Config,
    plan: &WorkPlan,
    done: &[String],
) -> Vec<WorkItemSummary> {
    done.iter()
        .filter_map(|id| plan.item(id))
        .filter_map(|item| item_summary(config, item))
        .collect()
}

/// Rebuild a completed item's summary from its persisted workflow run.
pub(crate) fn item_summary(config: &Config, item: &PlanItem) -> Option<WorkItemSummary> {
    let path = config
        .runs_dir
        .join("items")
        .join(format!("{}.json", item.id));
    let run: ItemRun = serde_json::from_str(&std::fs::read_to_string(path).ok()?).ok()?;

    let mut summary = WorkItemSummary {
        id: item.id.clone(),
        title: item.title.clone(),
        status: "completed".to_string(),
        completed_at: Some(run.updated_at),
        notes: item.description.clone(),
        ..WorkItemSummary::default()
    };
    let assignment = WorkItem::new(&item.id, &item.title, &item.description)
        .auto_assign()
        .assignment;
    if let Some(assignment) = assignment {
        summary.executor = Some(assignment.executor);
        summary.reviewer = Some(assignment.reviewer);
    }
    for phase in &run.phases {
        let Some(result) = &phase.result else { continue };
        match phase.phase.as_str() {
            "development" => {
                if let Ok(outcome) = serde_json::from_value::<AgentOutcome>(result.clone()) {
                    summary.summary = outcome.summary;
                    summary.files_modified = outcome.files_modified;
                }
            }
            "quality_gate" => {
                if let Ok(outcome) = serde_json::from_value::<AgentOutcome>(result.clone()) {
                    summary.confidence = outcome.confidence;
                }
            }
            _ => {}
        }
    }
    Some(summary)
}
