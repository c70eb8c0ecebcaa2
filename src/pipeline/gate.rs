//! Quality gate over epic result payloads.

use serde::{Deserialize, Serialize};

use crate::executor::AgentOutcome;

/// Gate verdicts, in descending order of goodness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    NeedsRevision,
    Blocked,
}

impl GateVerdict {
    pub fn slug(&self) -> &'static str {
        match self {
            GateVerdict::Pass => "pass",
            GateVerdict::NeedsRevision => "needs_revision",
            GateVerdict::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// Evaluate an epic's result payload against the pass threshold.
///
/// A blocking flag wins over any confidence score; an absent confidence
/// never passes.
pub fn evaluate(outcome: &AgentOutcome, pass_threshold: u8) -> GateVerdict {
    if outcome.blocking {
        return GateVerdict::Blocked;
    }
    match outcome.confidence {
        Some(confidence) if confidence >= pass_threshold => GateVerdict::Pass,
        _ => GateVerdict::NeedsRevision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(confidence: Option<u8>, blocking: bool) -> AgentOutcome {
        AgentOutcome {
            summary: "work".into(),
            confidence,
            files_modified: Vec::new(),
            blocking,
        }
    }

    #[test]
    fn test_confidence_at_threshold_passes() {
        assert_eq!(evaluate(&outcome(Some(70), false), 70), GateVerdict::Pass);
        assert_eq!(evaluate(&outcome(Some(100), false), 70), GateVerdict::Pass);
    }

    #[test]
    fn test_confidence_below_threshold_needs_revision() {
        assert_eq!(
            evaluate(&outcome(Some(69), false), 70),
            GateVerdict::NeedsRevision
        );
        assert_eq!(evaluate(&outcome(Some(0), false), 70), GateVerdict::NeedsRevision);
    }

    #[test]
    fn test_missing_confidence_never_passes() {
        assert_eq!(evaluate(&outcome(None, false), 70), GateVerdict::NeedsRevision);
        assert_eq!(evaluate(&outcome(None, false), 0), GateVerdict::NeedsRevision);
    }

    #[test]
    fn test_blocking_flag_wins_over_confidence() {
        assert_eq!(evaluate(&outcome(Some(100), true), 70), GateVerdict::Blocked);
        assert_eq!(evaluate(&outcome(None, true), 70), GateVerdict::Blocked);
    }
}
