//! Stuck and circular-approach detection over attempt history.

use super::RecoveryAttempt;

/// Identical signatures this many times in a row count as circular.
pub const CIRCULAR_REPEAT_COUNT: usize = 3;

/// Consecutive failures beyond this trip the stuck check.
pub const CONSECUTIVE_FAILURE_CAP: usize = 3;

/// Verdict over one epic's ordered attempt list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckVerdict {
    /// The same normalized error signature keeps coming back.
    pub circular: bool,
    /// Too many failures in a row, whatever their shape.
    pub too_many_consecutive: bool,
}

impl StuckVerdict {
    pub fn is_stuck(&self) -> bool {
        self.circular || self.too_many_consecutive
    }
}

/// Inspect the full ordered attempt history for one epic.
///
/// Circular means the trailing [`CIRCULAR_REPEAT_COUNT`] attempts share one
/// signature: the same approach is failing the same way each time, and
/// retrying it again is pointless.
pub fn inspect(attempts: &[RecoveryAttempt]) -> StuckVerdict {
    let circular = attempts.len() >= CIRCULAR_REPEAT_COUNT && {
        let tail = &attempts[attempts.len() - CIRCULAR_REPEAT_COUNT..];
        tail.iter().all(|a| a.signature == tail[0].signature)
    };
    StuckVerdict {
        circular,
        too_many_consecutive: attempts.len() >= CONSECUTIVE_FAILURE_CAP,
    }
}
