use chrono::Utc;
use std::path::PathBuf;
use tracing::{debug, info};

use super::migrate;
use super::{
    ActionType, CRASH_THRESHOLD_MINUTES, EpicInfo, SessionPatch, SessionState,
};
use crate::config::Config;
use crate::errors::SessionError;

/// Result of a crash probe over the persisted session.
#[derive(Debug, Clone)]
pub struct CrashStatus {
    pub is_crash: bool,
    pub idle_minutes: i64,
    pub last_action_type: ActionType,
}

/// Reads and writes the session record under `.conductor/session/`.
pub struct SessionStore {
    path: PathBuf,
    legacy_path: PathBuf,
}

impl SessionStore {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.session_file.clone(),
            legacy_path: config.legacy_session_file.clone(),
        }
    }

    /// Whether a session exists in either the current or legacy layout.
    pub fn exists(&self) -> bool {
        self.path.exists() || self.legacy_path.exists()
    }

    /// Seed and persist a fresh session for one epic.
    pub fn create(
        &self,
        epic: EpicInfo,
        branch: Option<String>,
    ) -> Result<SessionState, SessionError> {
        let state = SessionState::seed(epic, branch);
        self.save(&state)?;
        info!(
            epic_id = %state.epic_id,
            items = state.total_items,
            "session created"
        );
        Ok(state)
    }

    /// Load the session, auto-migrating a legacy v1 record if that is all
    /// that exists.
    pub fn load(&self) -> Result<SessionState, SessionError> {
        if !self.path.exists() && self.legacy_path.exists() {
            let state = migrate::migrate_legacy(&self.legacy_path, &self.path)?;
            info!(epic_id = %state.epic_id, "migrated legacy session state");
            return Ok(state);
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound {
                    path: self.path.clone(),
                });
            }
            Err(source) => {
                return Err(SessionError::ReadFailed {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| SessionError::ParseFailed {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SessionError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(state).map_err(|e| SessionError::WriteFailed {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        std::fs::write(&self.path, json).map_err(|source| SessionError::WriteFailed {
            path: self.path.clone(),
            source,
        })
    }

    /// Load, merge the patch, validate, persist. An inconsistent merge is
    /// rejected and the on-disk record stays untouched.
    pub fn update(&self, patch: SessionPatch) -> Result<SessionState, SessionError> {
        let mut state = self.load()?;
        state.apply(patch);
        state.validate()?;
        self.save(&state)?;
        debug!(
            epic_id = %state.epic_id,
            action = %state.last_action.action_type,
            "session updated"
        );
        Ok(state)
    }

    /// A crash is declared only when the record is older than the idle
    /// threshold AND the last action was not a clean stop.
    pub fn detect_crash(&self) -> Result<CrashStatus, SessionError> {
        let state = self.load()?;
        let idle_minutes = Utc::now()
            .signed_duration_since(state.last_updated)
            .num_minutes();
        let clean = state.last_action.action_type.is_clean_stop();
        Ok(CrashStatus {
            is_crash: idle_minutes > CRASH_THRESHOLD_MINUTES && !clean,
            idle_minutes,
            last_action_type: state.last_action.action_type,
        })
    }

    /// Archive the session by rename; returns the archived path. Session
    /// overrides live inside the record, so archiving retires them with it.
    pub fn discard(&self) -> Result<PathBuf, SessionError> {
        if !self.path.exists() {
            return Err(SessionError::NotFound {
                path: self.path.clone(),
            });
        }
        let archived = self.path.with_extension(format!(
            "json.discarded.{}",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        std::fs::rename(&self.path, &archived).map_err(|source| SessionError::WriteFailed {
            path: archived.clone(),
            source,
        })?;
        info!(archived = %archived.display(), "session discarded");
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{LastAction, OverridesPatch, ProgressPatch};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn make_store() -> (SessionStore, Config, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        (SessionStore::new(&config), config, dir)
    }

    fn sample_epic() -> EpicInfo {
        EpicInfo {
            epic_id: "epic-3".into(),
            epic_title: "Execution".into(),
            items: vec!["item-1".into(), "item-2".into()],
        }
    }

    #[test]
    fn test_create_then_load_round_trips() {
        let (store, _config, _dir) = make_store();
        let created = store.create(sample_epic(), Some("main".into())).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_load_without_session_is_not_found() {
        let (store, _config, _dir) = make_store();
        assert!(!store.exists());
        let err = store.load().unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[test]
    fn test_load_survives_process_restart() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();

        {
            let store = SessionStore::new(&config);
            store.create(sample_epic(), None).unwrap();
            store
                .update(SessionPatch::default().progress(ProgressPatch {
                    current_item: Some(Some("item-1".into())),
                    ..ProgressPatch::default()
                }))
                .unwrap();
        }

        {
            let store = SessionStore::new(&config);
            let state = store.load().unwrap();
            assert_eq!(state.progress.current_item.as_deref(), Some("item-1"));
        }
    }

    #[test]
    fn test_corrupt_session_is_parse_failed() {
        let (store, config, _dir) = make_store();
        std::fs::create_dir_all(&config.session_dir).unwrap();
        std::fs::write(&config.session_file, "{not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, SessionError::ParseFailed { .. }));
    }

    #[test]
    fn test_inconsistent_update_is_rejected_and_not_persisted() {
        let (store, _config, _dir) = make_store();
        store.create(sample_epic(), None).unwrap();

        // Claim an item as done without removing it from pending.
        let err = store
            .update(SessionPatch::default().progress(ProgressPatch {
                done: Some(vec!["item-1".into()]),
                ..ProgressPatch::default()
            }))
            .unwrap_err();
        assert!(matches!(err, SessionError::Inconsistent(_)));

        let state = store.load().unwrap();
        assert!(state.progress.done.is_empty());
    }

    #[test]
    fn test_detect_crash_fresh_session_is_clean() {
        let (store, _config, _dir) = make_store();
        store.create(sample_epic(), None).unwrap();
        let status = store.detect_crash().unwrap();
        assert!(!status.is_crash);
        assert_eq!(status.last_action_type, ActionType::EpicStarted);
    }

    #[test]
    fn test_detect_crash_old_phase_change_is_crash() {
        let (store, _config, _dir) = make_store();
        let mut state = store.create(sample_epic(), None).unwrap();
        state.last_action = LastAction::now(ActionType::PhaseChange);
        state.last_updated = Utc::now() - chrono::Duration::minutes(45);
        store.save(&state).unwrap();

        let status = store.detect_crash().unwrap();
        assert!(status.is_crash);
        assert!(status.idle_minutes >= 45);
        assert_eq!(status.last_action_type, ActionType::PhaseChange);
    }

    #[test]
    fn test_detect_crash_old_pause_is_not_crash() {
        let (store, _config, _dir) = make_store();
        let mut state = store.create(sample_epic(), None).unwrap();
        state.last_action = LastAction::now(ActionType::Pause);
        state.last_updated = Utc::now() - chrono::Duration::hours(6);
        store.save(&state).unwrap();

        let status = store.detect_crash().unwrap();
        assert!(!status.is_crash);
    }

    #[test]
    fn test_detect_crash_recent_phase_change_is_not_crash() {
        let (store, _config, _dir) = make_store();
        let mut state = store.create(sample_epic(), None).unwrap();
        state.last_action = LastAction::now(ActionType::PhaseChange);
        state.last_updated = Utc::now() - chrono::Duration::minutes(5);
        store.save(&state).unwrap();

        assert!(!store.detect_crash().unwrap().is_crash);
    }

    #[test]
    fn test_discard_archives_rather_than_deletes() {
        let (store, config, _dir) = make_store();
        let mut set = BTreeMap::new();
        set.insert("verbose".to_string(), "true".to_string());
        store.create(sample_epic(), None).unwrap();
        store
            .update(SessionPatch::default().overrides(OverridesPatch {
                set,
                remove: vec![],
            }))
            .unwrap();

        let archived = store.discard().unwrap();
        assert!(!config.session_file.exists());
        assert!(archived.exists());
        assert!(
            archived
                .file_name()
                .unwrap()
                .to_string_lossy()
                .contains("discarded")
        );

        // A new session starts clean; the archived overrides stay archived.
        let fresh = store.create(sample_epic(), None).unwrap();
        assert!(fresh.overrides.is_empty());
    }

    #[test]
    fn test_discard_without_session_is_not_found() {
        let (store, _config, _dir) = make_store();
        assert!(matches!(
            store.discard().unwrap_err(),
            SessionError::NotFound { .. }
        ));
    }

    #[test]
    fn test_overrides_survive_normal_updates() {
        let (store, _config, _dir) = make_store();
        store.create(sample_epic(), None).unwrap();
        let mut set = BTreeMap::new();
        set.insert("verbose".to_string(), "true".to_string());
        store
            .update(SessionPatch::default().overrides(OverridesPatch {
                set,
                remove: vec![],
            }))
            .unwrap();

        let state = store
            .update(SessionPatch::default().progress(ProgressPatch {
                current_item: Some(Some("item-1".into())),
                ..ProgressPatch::default()
            }))
            .unwrap();
        assert_eq!(state.overrides.get("verbose").map(String::as_str), Some("true"));
    }
}
