//! One-way migration from the v1 flat session layout.
//!
//! v1 kept a single `.conductor/session-state.json` with story-oriented
//! field names. Migration maps it into the v2 schema and renames the legacy
//! file to `session-state.json.migrated` so nothing is ever destroyed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use super::{
    ActionType, ContextSnapshot, LastAction, Progress, SESSION_SCHEMA_VERSION, SessionState,
    WorkflowSnapshot,
};
use crate::errors::SessionError;

/// The v1 on-disk record. Read-only; only `migrate_legacy` consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySessionState {
    pub story_id: String,
    pub story_title: String,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub remaining: Vec<String>,
    #[serde(default)]
    pub active: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub(super) fn migrate_legacy(
    legacy_path: &Path,
    target_path: &Path,
) -> Result<SessionState, SessionError> {
    let content = std::fs::read_to_string(legacy_path).map_err(|e| {
        SessionError::MigrationFailed(format!(
            "cannot read legacy session {}: {}",
            legacy_path.display(),
            e
        ))
    })?;
    let legacy: LegacySessionState = serde_json::from_str(&content).map_err(|e| {
        SessionError::MigrationFailed(format!(
            "legacy session {} is not parseable: {}",
            legacy_path.display(),
            e
        ))
    })?;

    let state = map_legacy(legacy);
    state.validate().map_err(|e| {
        SessionError::MigrationFailed(format!("migrated record is inconsistent: {}", e))
    })?;

    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SessionError::MigrationFailed(format!("cannot create session directory: {}", e))
        })?;
    }
    let json = serde_json::to_string_pretty(&state)
        .map_err(|e| SessionError::MigrationFailed(format!("cannot serialize record: {}", e)))?;
    std::fs::write(target_path, json).map_err(|e| {
        SessionError::MigrationFailed(format!(
            "cannot write migrated session {}: {}",
            target_path.display(),
            e
        ))
    })?;

    // Archive the legacy file only after the v2 record is safely on disk.
    let archived = legacy_path.with_extension("json.migrated");
    std::fs::rename(legacy_path, &archived).map_err(|e| {
        SessionError::MigrationFailed(format!(
            "cannot archive legacy session to {}: {}",
            archived.display(),
            e
        ))
    })?;

    Ok(state)
}

fn map_legacy(legacy: LegacySessionState) -> SessionState {
    let timestamp = legacy.updated_at.unwrap_or_else(Utc::now);

    let done = legacy.completed;
    let mut pending = legacy.remaining;
    let mut current_item = None;
    if let Some(active) = legacy.active {
        if done.contains(&active) {
            // v1 let an item be active and completed at once; done wins.
            warn!(item = %active, "legacy active item already completed, dropping");
        } else {
            if !pending.contains(&active) {
                pending.insert(0, active.clone());
            }
            current_item = Some(active);
        }
    }

    let mut state = SessionState {
        version: SESSION_SCHEMA_VERSION,
        epic_id: legacy.story_id,
        epic_title: legacy.story_title,
        total_items: done.len() + pending.len(),
        progress: Progress {
            current_item: current_item.clone(),
            done,
            pending,
        },
        workflow: WorkflowSnapshot {
            current_phase: legacy.phase.clone(),
            attempt: if legacy.phase.is_some() { 1 } else { 0 },
            phase_results: Default::default(),
        },
        last_action: LastAction {
            action_type: if legacy.phase.is_some() {
                ActionType::PhaseChange
            } else {
                ActionType::EpicStarted
            },
            timestamp,
            item: current_item,
            phase: legacy.phase,
        },
        context_snapshot: ContextSnapshot::default(),
        resume_instructions: Vec::new(),
        overrides: Default::default(),
        created_at: timestamp,
        // Preserve the legacy timestamp so crash detection measures real
        // elapsed time, not the migration moment.
        last_updated: timestamp,
    };
    state.resume_instructions = state.render_resume_instructions();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::SessionStore;
    use tempfile::tempdir;

    fn write_legacy(config: &Config, json: &str) {
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(&config.legacy_session_file, json).unwrap();
    }

    #[test]
    fn test_legacy_fields_map_into_v2_schema() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        write_legacy(
            &config,
            r#"{
                "story_id": "story-7",
                "story_title": "Checkout flow",
                "completed": ["a", "b"],
                "remaining": ["c", "d"],
                "active": "c",
                "phase": "development",
                "updated_at": "2026-08-20T10:00:00Z"
            }"#,
        );

        let store = SessionStore::new(&config);
        let state = store.load().unwrap();

        assert_eq!(state.version, SESSION_SCHEMA_VERSION);
        assert_eq!(state.epic_id, "story-7");
        assert_eq!(state.epic_title, "Checkout flow");
        assert_eq!(state.total_items, 4);
        assert_eq!(state.progress.done, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(state.progress.current_item.as_deref(), Some("c"));
        assert_eq!(state.workflow.current_phase.as_deref(), Some("development"));
        assert_eq!(state.last_action.action_type, ActionType::PhaseChange);
        assert_eq!(
            state.last_updated,
            "2026-08-20T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_legacy_file_is_archived_not_deleted() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        write_legacy(
            &config,
            r#"{"story_id": "s", "story_title": "t", "remaining": ["x"]}"#,
        );

        SessionStore::new(&config).load().unwrap();

        assert!(!config.legacy_session_file.exists());
        assert!(config.session_file.exists());
        let archived = config
            .state_dir
            .join("session-state.json.migrated");
        assert!(archived.exists());
        // The archived copy still holds the original fields.
        let content = std::fs::read_to_string(archived).unwrap();
        assert!(content.contains("story_id"));
    }

    #[test]
    fn test_migration_runs_once() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        write_legacy(
            &config,
            r#"{"story_id": "s", "story_title": "t", "remaining": ["x"]}"#,
        );

        let store = SessionStore::new(&config);
        let first = store.load().unwrap();
        // Second load reads the migrated v2 file directly.
        let second = store.load().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_active_item_missing_from_remaining_is_reinstated() {
        let legacy = LegacySessionState {
            story_id: "s".into(),
            story_title: "t".into(),
            completed: vec!["a".into()],
            remaining: vec!["b".into()],
            active: Some("c".into()),
            phase: None,
            updated_at: None,
        };
        let state = map_legacy(legacy);
        assert_eq!(state.progress.pending, vec!["c".to_string(), "b".to_string()]);
        assert_eq!(state.progress.current_item.as_deref(), Some("c"));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_active_item_already_completed_is_dropped() {
        let legacy = LegacySessionState {
            story_id: "s".into(),
            story_title: "t".into(),
            completed: vec!["a".into()],
            remaining: vec!["b".into()],
            active: Some("a".into()),
            phase: None,
            updated_at: None,
        };
        let state = map_legacy(legacy);
        assert!(state.progress.current_item.is_none());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_unparseable_legacy_is_migration_failed() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        write_legacy(&config, "not json at all");

        let err = SessionStore::new(&config).load().unwrap_err();
        assert!(matches!(err, SessionError::MigrationFailed(_)));
    }

    #[test]
    fn test_crash_detection_uses_legacy_timestamp() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let old = Utc::now() - chrono::Duration::minutes(45);
        write_legacy(
            &config,
            &format!(
                r#"{{"story_id": "s", "story_title": "t", "remaining": ["x"],
                    "active": "x", "phase": "development",
                    "updated_at": "{}"}}"#,
                old.to_rfc3339()
            ),
        );

        let store = SessionStore::new(&config);
        let status = store.detect_crash().unwrap();
        assert!(status.is_crash);
    }
}
