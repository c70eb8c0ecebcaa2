//! Typed error hierarchy for the Conductor orchestrator.
//!
//! Each subsystem gets its own top-level enum:
//! - `LockError` — file-lock acquisition and release failures
//! - `SessionError` — session-state store failures
//! - `PipelineError` — pipeline state machine and run-record failures
//! - `WorkflowError` — per-item phase engine failures
//! - `SettingsError` — configuration-layer failures
//!
//! Expected outcomes (lock contention, gate verdicts, checkpoint waiting)
//! are modelled as enum results on the respective APIs, not as errors.

use thiserror::Error;

/// Errors from the lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to read lock file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write lock file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock record at {path} is not valid JSON: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Lock '{resource}' is held by pid {holder_pid}, not this process")]
    NotOwner { resource: String, holder_pid: u32 },

    #[error("No lock record exists for '{resource}'")]
    NotHeld { resource: String },
}

/// Errors from the session state store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session state exists at {path}")]
    NotFound { path: std::path::PathBuf },

    #[error("Failed to read session state at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write session state at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session state at {path} failed to parse: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session record is inconsistent: {0}")]
    Inconsistent(String),

    #[error("Legacy session migration failed: {0}")]
    MigrationFailed(String),
}

/// Errors from the pipeline state machine and its persisted run records.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline for '{work_item}' is in state {state}, expected Ready or InProgress")]
    NotRunnable { work_item: String, state: String },

    #[error("Epic {number} is not part of the pipeline definition")]
    UnknownEpic { number: u32 },

    #[error("Run record at {path} is missing required fields (workflow_id, status, epics)")]
    InvalidRunRecord { path: std::path::PathBuf },

    #[error("Failed to persist run record at {path}: {source}")]
    PersistFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single work item's phase engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Work item '{item}' has no executor assignment")]
    MissingAssignment { item: String },

    #[error("Work item '{item}' assigns '{agent}' as both implementer and reviewer")]
    ReviewerConflict { item: String, agent: String },

    #[error("No checkpoint decision is pending for '{item}'")]
    NoDecisionPending { item: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the layered settings system.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings at {path} failed to parse: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(
        "Condition '{expr}' mixes && and || without parentheses; \
         group the expression explicitly"
    )]
    AmbiguousCondition { expr: String },

    #[error("Condition '{expr}' is not a valid expression: {reason}")]
    InvalidCondition { expr: String, reason: String },
}
