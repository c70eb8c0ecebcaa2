//! Typed pipeline events and the observer list that fans them out.
//!
//! Sinks fire synchronously in registration order, immediately after the
//! state mutation the event describes and before the next phase begins. A
//! sink failure is logged and never propagates; observability must not be
//! able to break the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Everything the orchestrator announces while it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStateChanged {
        work_item: String,
        from: String,
        to: String,
    },
    EpicStarted {
        number: u32,
        name: String,
        attempt: u32,
    },
    EpicCompleted {
        number: u32,
        name: String,
        status: String,
    },
    GateEvaluated {
        epic: u32,
        verdict: String,
        confidence: Option<u8>,
    },
    PhaseStarted {
        item: String,
        phase: String,
        agent: String,
    },
    PhaseCompleted {
        item: String,
        phase: String,
        status: String,
    },
    RecoverySelected {
        epic: u32,
        strategy: String,
        error_class: String,
    },
    Escalated {
        epic: u32,
        report_path: String,
    },
    CheckpointDecision {
        item: String,
        decision: String,
    },
}

impl PipelineEvent {
    /// Short slug for status displays.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStateChanged { .. } => "pipeline_state_changed",
            PipelineEvent::EpicStarted { .. } => "epic_started",
            PipelineEvent::EpicCompleted { .. } => "epic_completed",
            PipelineEvent::GateEvaluated { .. } => "gate_evaluated",
            PipelineEvent::PhaseStarted { .. } => "phase_started",
            PipelineEvent::PhaseCompleted { .. } => "phase_completed",
            PipelineEvent::RecoverySelected { .. } => "recovery_selected",
            PipelineEvent::Escalated { .. } => "escalated",
            PipelineEvent::CheckpointDecision { .. } => "checkpoint_decision",
        }
    }
}

/// One observer. Implementations must not block for long and must not panic.
pub trait EventSink: Send {
    fn on_event(&mut self, event: &PipelineEvent);
}

/// Ordered observer list.
#[derive(Default)]
pub struct EventBus {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks fire in the order they were registered.
    pub fn register(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        for sink in &mut self.sinks {
            sink.on_event(&event);
        }
    }
}

/// On-disk shape of `.conductor/status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub updated_at: DateTime<Utc>,
    pub last_event: PipelineEvent,
    /// Most recent events, oldest first, bounded.
    pub recent: Vec<String>,
}

/// Sink that rewrites the status file after every event, so an external
/// dashboard can poll one small JSON document.
pub struct StatusFileSink {
    path: PathBuf,
    recent: Vec<String>,
    max_recent: usize,
}

impl StatusFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recent: Vec::new(),
            max_recent: 20,
        }
    }
}

impl EventSink for StatusFileSink {
    fn on_event(&mut self, event: &PipelineEvent) {
        self.recent.push(event.kind().to_string());
        if self.recent.len() > self.max_recent {
            let excess = self.recent.len() - self.max_recent;
            self.recent.drain(..excess);
        }
        let snapshot = StatusSnapshot {
            updated_at: Utc::now(),
            last_event: event.clone(),
            recent: self.recent.clone(),
        };
        let write = serde_json::to_string_pretty(&snapshot)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = write {
            warn!(path = %self.path.display(), error = %e, "status sink write failed");
        }
    }
}

/// Sink that forwards events into the tracing log.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&mut self, event: &PipelineEvent) {
        tracing::info!(kind = event.kind(), event = ?event, "pipeline event");
    }
}
