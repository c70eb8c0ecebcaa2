//! Durable session state for one epic's run.
//!
//! The session record is the orchestrator's crash journal: which items are
//! done, which phase the current item is in, what the last recorded action
//! was. It is updated after every phase transition and read back on startup
//! to decide between "clean resume" and "crash recovery".
//!
//! Updates go through [`SessionPatch`]: one typed patch struct per
//! subsection, each with explicit merge rules, so a partial update can never
//! silently clobber unrelated fields.

mod migrate;
mod store;

pub use migrate::LegacySessionState;
pub use store::{CrashStatus, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::SessionError;

/// Current on-disk schema version.
pub const SESSION_SCHEMA_VERSION: u32 = 2;

/// Idle threshold beyond which a non-clean last action means a crash.
pub const CRASH_THRESHOLD_MINUTES: i64 = 30;

/// The kind of the last recorded orchestrator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    EpicStarted,
    ItemStarted,
    ItemCompleted,
    PhaseChange,
    Pause,
    Resume,
    Abort,
}

impl ActionType {
    /// Clean stops never count as crashes, no matter how old the record is.
    pub fn is_clean_stop(&self) -> bool {
        matches!(
            self,
            ActionType::Pause | ActionType::ItemCompleted | ActionType::Abort
        )
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::EpicStarted => "EPIC_STARTED",
            ActionType::ItemStarted => "ITEM_STARTED",
            ActionType::ItemCompleted => "ITEM_COMPLETED",
            ActionType::PhaseChange => "PHASE_CHANGE",
            ActionType::Pause => "PAUSE",
            ActionType::Resume => "RESUME",
            ActionType::Abort => "ABORT",
        };
        write!(f, "{}", s)
    }
}

/// Item-level progress through the epic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current_item: Option<String>,
    pub done: Vec<String>,
    pub pending: Vec<String>,
}

/// Snapshot of the per-item workflow engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub current_phase: Option<String>,
    pub attempt: u32,
    /// Opaque per-phase result payloads, keyed by phase id.
    #[serde(default)]
    pub phase_results: BTreeMap<String, serde_json::Value>,
}

/// The last action the orchestrator recorded before writing this state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastAction {
    pub action_type: ActionType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl LastAction {
    pub fn now(action_type: ActionType) -> Self {
        Self {
            action_type,
            timestamp: Utc::now(),
            item: None,
            phase: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

/// Workspace context captured alongside progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub files_touched: Vec<String>,
    /// Item counts per executor, e.g. `"@dev" -> 3`.
    pub executor_histogram: BTreeMap<String, u32>,
    pub branch: Option<String>,
}

/// The persisted session record (schema v2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub epic_id: String,
    pub epic_title: String,
    pub total_items: usize,
    pub progress: Progress,
    pub workflow: WorkflowSnapshot,
    pub last_action: LastAction,
    pub context_snapshot: ContextSnapshot,
    /// Regenerated from the merged state on every update.
    pub resume_instructions: Vec<String>,
    /// Session-scoped toggles; survive updates, die with the session.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Identity and item set of the epic a session tracks.
#[derive(Debug, Clone)]
pub struct EpicInfo {
    pub epic_id: String,
    pub epic_title: String,
    pub items: Vec<String>,
}

impl SessionState {
    pub(crate) fn seed(epic: EpicInfo, branch: Option<String>) -> Self {
        let now = Utc::now();
        let mut state = Self {
            version: SESSION_SCHEMA_VERSION,
            epic_id: epic.epic_id,
            epic_title: epic.epic_title,
            total_items: epic.items.len(),
            progress: Progress {
                current_item: None,
                done: Vec::new(),
                pending: epic.items,
            },
            workflow: WorkflowSnapshot::default(),
            last_action: LastAction::now(ActionType::EpicStarted),
            context_snapshot: ContextSnapshot {
                branch,
                ..ContextSnapshot::default()
            },
            resume_instructions: Vec::new(),
            overrides: BTreeMap::new(),
            created_at: now,
            last_updated: now,
        };
        state.resume_instructions = state.render_resume_instructions();
        state
    }

    /// `done ∪ pending` must partition the item set and `current_item` must
    /// be pending (or unset).
    pub fn validate(&self) -> Result<(), SessionError> {
        for item in &self.progress.done {
            if self.progress.pending.contains(item) {
                return Err(SessionError::Inconsistent(format!(
                    "item '{}' is both done and pending",
                    item
                )));
            }
        }
        let tracked = self.progress.done.len() + self.progress.pending.len();
        if tracked != self.total_items {
            return Err(SessionError::Inconsistent(format!(
                "{} items tracked but total_items is {}",
                tracked, self.total_items
            )));
        }
        if let Some(ref current) = self.progress.current_item
            && !self.progress.pending.contains(current)
        {
            return Err(SessionError::Inconsistent(format!(
                "current item '{}' is not pending",
                current
            )));
        }
        Ok(())
    }

    /// Apply a patch, stamp `last_updated`, regenerate resume instructions.
    pub(crate) fn apply(&mut self, patch: SessionPatch) {
        if let Some(progress) = patch.progress {
            progress.apply_to(&mut self.progress);
        }
        if let Some(workflow) = patch.workflow {
            workflow.apply_to(&mut self.workflow);
        }
        if let Some(last_action) = patch.last_action {
            self.last_action = last_action;
        }
        if let Some(snapshot) = patch.context_snapshot {
            snapshot.apply_to(&mut self.context_snapshot);
        }
        if let Some(overrides) = patch.overrides {
            overrides.apply_to(&mut self.overrides);
        }
        self.last_updated = Utc::now();
        self.resume_instructions = self.render_resume_instructions();
    }

    fn render_resume_instructions(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Epic '{}' ({}): {}/{} items done.",
            self.epic_title,
            self.epic_id,
            self.progress.done.len(),
            self.total_items
        )];
        match (&self.progress.current_item, &self.workflow.current_phase) {
            (Some(item), Some(phase)) => lines.push(format!(
                "Current item: {} in phase '{}' (attempt {}).",
                item, phase, self.workflow.attempt
            )),
            (Some(item), None) => lines.push(format!("Current item: {} (not yet started).", item)),
            (None, _) => match self.progress.pending.first() {
                Some(next) => lines.push(format!("Next pending item: {}.", next)),
                None => lines.push("All items are done.".to_string()),
            },
        }
        lines.push(format!(
            "Last action: {} at {}.",
            self.last_action.action_type,
            self.last_action.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        lines.push("Run `conductor resume` to continue.".to_string());
        lines
    }
}

/// Partial update; each subsection merges independently.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub progress: Option<ProgressPatch>,
    pub workflow: Option<WorkflowPatch>,
    /// Whole-struct replacement.
    pub last_action: Option<LastAction>,
    pub context_snapshot: Option<ContextSnapshotPatch>,
    pub overrides: Option<OverridesPatch>,
}

impl SessionPatch {
    pub fn progress(mut self, patch: ProgressPatch) -> Self {
        self.progress = Some(patch);
        self
    }

    pub fn workflow(mut self, patch: WorkflowPatch) -> Self {
        self.workflow = Some(patch);
        self
    }

    pub fn last_action(mut self, action: LastAction) -> Self {
        self.last_action = Some(action);
        self
    }

    pub fn context_snapshot(mut self, patch: ContextSnapshotPatch) -> Self {
        self.context_snapshot = Some(patch);
        self
    }

    pub fn overrides(mut self, patch: OverridesPatch) -> Self {
        self.overrides = Some(patch);
        self
    }
}

/// Progress merge rules: present fields replace wholesale, `current_item`
/// distinguishes "leave alone" (None) from "clear" (Some(None)).
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub current_item: Option<Option<String>>,
    pub done: Option<Vec<String>>,
    pub pending: Option<Vec<String>>,
}

impl ProgressPatch {
    fn apply_to(self, progress: &mut Progress) {
        if let Some(current_item) = self.current_item {
            progress.current_item = current_item;
        }
        if let Some(done) = self.done {
            progress.done = done;
        }
        if let Some(pending) = self.pending {
            progress.pending = pending;
        }
    }

    /// Move `item` from pending to done and clear it as current.
    pub fn complete_item(progress: &Progress, item: &str) -> Self {
        let mut done = progress.done.clone();
        if !done.iter().any(|i| i == item) {
            done.push(item.to_string());
        }
        let pending = progress
            .pending
            .iter()
            .filter(|i| i.as_str() != item)
            .cloned()
            .collect();
        Self {
            current_item: Some(None),
            done: Some(done),
            pending: Some(pending),
        }
    }
}

/// Workflow merge rules: scalar fields replace; `phase_results` entries are
/// inserted by key, absent keys preserved.
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub current_phase: Option<Option<String>>,
    pub attempt: Option<u32>,
    pub phase_results: Option<BTreeMap<String, serde_json::Value>>,
}

impl WorkflowPatch {
    fn apply_to(self, workflow: &mut WorkflowSnapshot) {
        if let Some(current_phase) = self.current_phase {
            workflow.current_phase = current_phase;
        }
        if let Some(attempt) = self.attempt {
            workflow.attempt = attempt;
        }
        if let Some(phase_results) = self.phase_results {
            workflow.phase_results.extend(phase_results);
        }
    }
}

/// Context merge rules: `files_touched` unions (order-preserving),
/// `executor_histogram` counts add, `branch` replaces when present.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshotPatch {
    pub files_touched: Option<Vec<String>>,
    pub executor_increment: Option<String>,
    pub branch: Option<Option<String>>,
}

impl ContextSnapshotPatch {
    fn apply_to(self, snapshot: &mut ContextSnapshot) {
        if let Some(files) = self.files_touched {
            for file in files {
                if !snapshot.files_touched.contains(&file) {
                    snapshot.files_touched.push(file);
                }
            }
        }
        if let Some(executor) = self.executor_increment {
            *snapshot.executor_histogram.entry(executor).or_insert(0) += 1;
        }
        if let Some(branch) = self.branch {
            snapshot.branch = branch;
        }
    }
}

/// Override merge rules: explicit set and remove lists.
#[derive(Debug, Clone, Default)]
pub struct OverridesPatch {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl OverridesPatch {
    fn apply_to(self, overrides: &mut BTreeMap<String, String>) {
        for (key, value) in self.set {
            overrides.insert(key, value);
        }
        for key in self.remove {
            overrides.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        SessionState::seed(
            EpicInfo {
                epic_id: "epic-3".into(),
                epic_title: "Execution".into(),
                items: vec!["item-1".into(), "item-2".into(), "item-3".into()],
            },
            Some("main".into()),
        )
    }

    #[test]
    fn test_seed_starts_with_all_items_pending() {
        let state = sample_state();
        assert_eq!(state.version, SESSION_SCHEMA_VERSION);
        assert_eq!(state.total_items, 3);
        assert!(state.progress.done.is_empty());
        assert_eq!(state.progress.pending.len(), 3);
        assert_eq!(state.last_action.action_type, ActionType::EpicStarted);
        assert_eq!(state.context_snapshot.branch.as_deref(), Some("main"));
        assert!(state.validate().is_ok());
        assert!(!state.resume_instructions.is_empty());
    }

    #[test]
    fn test_progress_patch_completes_item() {
        let mut state = sample_state();
        state.progress.current_item = Some("item-1".into());

        let patch = SessionPatch::default()
            .progress(ProgressPatch::complete_item(&state.progress, "item-1"))
            .last_action(LastAction::now(ActionType::ItemCompleted).with_item("item-1"));
        state.apply(patch);

        assert_eq!(state.progress.done, vec!["item-1".to_string()]);
        assert_eq!(state.progress.pending.len(), 2);
        assert!(state.progress.current_item.is_none());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_partial_patch_leaves_other_subsections_alone() {
        let mut state = sample_state();
        state.overrides.insert("verbose".into(), "true".into());
        let branch_before = state.context_snapshot.branch.clone();

        state.apply(SessionPatch::default().workflow(WorkflowPatch {
            current_phase: Some(Some("development".into())),
            attempt: Some(2),
            phase_results: None,
        }));

        assert_eq!(
            state.workflow.current_phase.as_deref(),
            Some("development")
        );
        assert_eq!(state.workflow.attempt, 2);
        // Untouched subsections persist, including session overrides.
        assert_eq!(state.overrides.get("verbose").map(String::as_str), Some("true"));
        assert_eq!(state.context_snapshot.branch, branch_before);
        assert_eq!(state.progress.pending.len(), 3);
    }

    #[test]
    fn test_phase_results_merge_by_key() {
        let mut state = sample_state();
        let mut first = BTreeMap::new();
        first.insert("validation".to_string(), serde_json::json!({"ok": true}));
        state.apply(SessionPatch::default().workflow(WorkflowPatch {
            phase_results: Some(first),
            ..WorkflowPatch::default()
        }));

        let mut second = BTreeMap::new();
        second.insert("development".to_string(), serde_json::json!({"ok": true}));
        state.apply(SessionPatch::default().workflow(WorkflowPatch {
            phase_results: Some(second),
            ..WorkflowPatch::default()
        }));

        assert_eq!(state.workflow.phase_results.len(), 2);
        assert!(state.workflow.phase_results.contains_key("validation"));
        assert!(state.workflow.phase_results.contains_key("development"));
    }

    #[test]
    fn test_context_snapshot_accumulates() {
        let mut state = sample_state();
        state.apply(
            SessionPatch::default().context_snapshot(ContextSnapshotPatch {
                files_touched: Some(vec!["src/a.rs".into(), "src/b.rs".into()]),
                executor_increment: Some("@dev".into()),
                branch: None,
            }),
        );
        state.apply(
            SessionPatch::default().context_snapshot(ContextSnapshotPatch {
                files_touched: Some(vec!["src/b.rs".into(), "src/c.rs".into()]),
                executor_increment: Some("@dev".into()),
                branch: None,
            }),
        );

        assert_eq!(state.context_snapshot.files_touched.len(), 3);
        assert_eq!(state.context_snapshot.executor_histogram["@dev"], 2);
        assert_eq!(state.context_snapshot.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_overrides_set_and_remove() {
        let mut state = sample_state();
        let mut set = BTreeMap::new();
        set.insert("verbose".to_string(), "true".to_string());
        state.apply(SessionPatch::default().overrides(OverridesPatch {
            set,
            remove: vec![],
        }));
        assert_eq!(state.overrides.len(), 1);

        state.apply(SessionPatch::default().overrides(OverridesPatch {
            set: BTreeMap::new(),
            remove: vec!["verbose".to_string()],
        }));
        assert!(state.overrides.is_empty());
    }

    #[test]
    fn test_resume_instructions_track_state() {
        let mut state = sample_state();
        state.apply(SessionPatch::default().progress(ProgressPatch {
            current_item: Some(Some("item-1".into())),
            ..ProgressPatch::default()
        }));
        state.apply(SessionPatch::default().workflow(WorkflowPatch {
            current_phase: Some(Some("development".into())),
            attempt: Some(1),
            phase_results: None,
        }));

        let text = state.resume_instructions.join("\n");
        assert!(text.contains("item-1"));
        assert!(text.contains("development"));
        assert!(text.contains("conductor resume"));
    }

    #[test]
    fn test_validate_rejects_done_and_pending_overlap() {
        let mut state = sample_state();
        state.progress.done.push("item-1".into());
        let err = state.validate().unwrap_err();
        assert!(matches!(err, SessionError::Inconsistent(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_current_item() {
        let mut state = sample_state();
        state.progress.current_item = Some("item-9".into());
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_clean_stop_classification() {
        assert!(ActionType::Pause.is_clean_stop());
        assert!(ActionType::ItemCompleted.is_clean_stop());
        assert!(ActionType::Abort.is_clean_stop());
        assert!(!ActionType::PhaseChange.is_clean_stop());
        assert!(!ActionType::EpicStarted.is_clean_stop());
        assert!(!ActionType::Resume.is_clean_stop());
    }

    #[test]
    fn test_action_type_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ActionType::PhaseChange).unwrap(),
            "\"PHASE_CHANGE\""
        );
        assert_eq!(
            serde_json::from_str::<ActionType>("\"ITEM_COMPLETED\"").unwrap(),
            ActionType::ItemCompleted
        );
    }
}
