//! Interactive checkpoint prompt.

use dialoguer::{Select, theme::ColorfulTheme};
use tracing::warn;

use crate::workflow::{CheckpointDecision, DecisionProvider};

/// Asks the operator what to do at an item checkpoint.
///
/// Returns `None` when no terminal is attended (CI, piped output), which the
/// workflow engine treats as "park the item and wait for `conductor decide`".
/// With `assume_continue` set (`--yes`), every checkpoint answers Continue
/// without prompting.
pub struct CheckpointPrompt {
    assume_continue: bool,
}

impl CheckpointPrompt {
    pub fn new(assume_continue: bool) -> Self {
        Self { assume_continue }
    }
}

impl DecisionProvider for CheckpointPrompt {
    fn decide(&mut self, item: &str) -> Option<CheckpointDecision> {
        if self.assume_continue {
            return Some(CheckpointDecision::Continue);
        }
        if !console::user_attended() {
            return None;
        }

        let options = &[
            "Continue to the next item",
            "Pause the run here",
            "Review this item's work again",
            "Abort the run",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Item '{}' finished. What next?", item))
            .items(options)
            .default(0)
            .interact();

        match selection {
            Ok(0) => Some(CheckpointDecision::Continue),
            Ok(1) => Some(CheckpointDecision::Pause),
            Ok(2) => Some(CheckpointDecision::Review),
            Ok(3) => Some(CheckpointDecision::Abort),
            Ok(_) => Some(CheckpointDecision::Continue),
            Err(e) => {
                warn!(error = %e, "checkpoint prompt failed, parking item");
                None
            }
        }
    }
}
