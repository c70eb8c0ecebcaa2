//! Startup routing: look at the project and decide what `conductor run`
//! should actually do.
//!
//! The decision tree is cheap filesystem probes only; nothing here mutates
//! state. A brand-new directory gets onboarding, an existing codebase gets
//! adopted, an initialized project starts or resumes depending on whether a
//! session is in flight and whether it stopped cleanly.

use tracing::debug;

use crate::config::{Config, is_initialized};
use crate::detect::detect_project;
use crate::session::SessionStore;

/// What the CLI should do for this project, in this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Empty directory, no conductor state: guided project setup.
    Onboard,
    /// Existing code without conductor state: initialize around it.
    Adopt,
    /// Initialized, nothing in flight: start a fresh run.
    Start,
    /// A session exists; `crashed` reports whether it stopped cleanly.
    Resume { crashed: bool },
}

impl Route {
    /// One-line explanation for logs and the status display.
    pub fn describe(&self) -> &'static str {
        match self {
            Route::Onboard => "new project, starting guided setup",
            Route::Adopt => "existing code without conductor state, adopting",
            Route::Start => "initialized project, starting a fresh run",
            Route::Resume { crashed: false } => "resuming the session in flight",
            Route::Resume { crashed: true } => "previous session crashed, recovering",
        }
    }
}

/// Decide the route for the configured project directory.
pub fn route(config: &Config) -> Route {
    if is_initialized(&config.project_dir) {
        let store = SessionStore::new(config);
        if store.exists() {
            let crashed = store
                .detect_crash()
                .map(|status| status.is_crash)
                .unwrap_or(false);
            debug!(crashed, "session found, routing to resume");
            return Route::Resume { crashed };
        }
        return Route::Start;
    }

    let profile = detect_project(&config.project_dir);
    if profile.is_empty() {
        Route::Onboard
    } else {
        debug!(environment = %profile.summary(), "unmanaged code found, routing to adopt");
        Route::Adopt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ActionType, EpicInfo, LastAction, SessionPatch};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn config_for(dir: &std::path::Path) -> Config {
        Config::new(dir.to_path_buf(), false).unwrap()
    }

    #[test]
    fn test_empty_directory_routes_to_onboard() {
        let dir = tempdir().unwrap();
        assert_eq!(route(&config_for(dir.path())), Route::Onboard);
    }

    #[test]
    fn test_unmanaged_code_routes_to_adopt() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        assert_eq!(route(&config_for(dir.path())), Route::Adopt);
    }

    #[test]
    fn test_initialized_without_session_routes_to_start() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        config.ensure_directories().unwrap();
        assert_eq!(route(&config), Route::Start);
    }

    #[test]
    fn test_live_session_routes_to_clean_resume() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        config.ensure_directories().unwrap();

        let store = SessionStore::new(&config);
        store
            .create(
                EpicInfo {
                    epic_id: "epic-1".into(),
                    epic_title: "Pipeline".into(),
                    items: vec!["item-1".into()],
                },
                None,
            )
            .unwrap();

        assert_eq!(route(&config), Route::Resume { crashed: false });
    }

    #[test]
    fn test_stale_dirty_session_routes_to_crash_recovery() {
        let dir = tempdir().unwrap();
        let config = config_for(dir.path());
        config.ensure_directories().unwrap();

        let store = SessionStore::new(&config);
        store
            .create(
                EpicInfo {
                    epic_id: "epic-1".into(),
                    epic_title: "Pipeline".into(),
                    items: vec!["item-1".into()],
                },
                None,
            )
            .unwrap();
        // Mid-work action, then silence past the crash threshold.
        store
            .update(
                SessionPatch::default()
                    .last_action(LastAction::now(ActionType::ItemStarted).with_item("item-1")),
            )
            .unwrap();
        let mut state = store.load().unwrap();
        state.last_updated = Utc::now() - Duration::minutes(45);
        store.save(&state).unwrap();

        assert_eq!(route(&config), Route::Resume { crashed: true });
    }
}
