use tracing::debug;

use super::{CompressionLevel, ContextTarget, WorkItemSummary, estimate_tokens};
use crate::conductor_config::ContextSection;

const DEFAULT_CONFIDENCE_THRESHOLD: u8 = 70;
const CONFIDENCE_THRESHOLD_ENV: &str = "CONDUCTOR_CONFIDENCE_THRESHOLD";

/// Free-text notes are cut to this many characters in cascade stage 3.
const NOTES_TRUNCATE_CHARS: usize = 120;
const TRUNCATION_TAIL: &str = "… [truncated]";

/// One formatted historical entry in the built context.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub item_id: String,
    pub distance: usize,
    pub level: CompressionLevel,
    pub flagged: bool,
    pub text: String,
    pub tokens: usize,
}

/// The assembled context plus its accounting.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub epic_id: String,
    pub entries: Vec<ContextEntry>,
    pub total_tokens: usize,
    pub token_budget: usize,
    pub text: String,
}

/// Builds bounded context from prior completed items.
///
/// The confidence threshold is read from `CONDUCTOR_CONFIDENCE_THRESHOLD`
/// once at construction; out-of-range or non-numeric values fall back to the
/// default of 70.
pub struct ContextAccumulator {
    token_budget: usize,
    entry_token_cap: usize,
    confidence_threshold: u8,
}

#[derive(Clone)]
struct Planned<'a> {
    item: &'a WorkItemSummary,
    distance: usize,
    level: CompressionLevel,
    truncate_notes: bool,
    drop_rich_fields: bool,
    flagged: bool,
}

impl ContextAccumulator {
    pub fn new(settings: &ContextSection) -> Self {
        Self {
            token_budget: settings.token_budget,
            entry_token_cap: settings.entry_token_cap,
            confidence_threshold: read_confidence_threshold(),
        }
    }

    /// Explicit thresholds, bypassing settings and environment.
    pub fn with_thresholds(
        token_budget: usize,
        entry_token_cap: usize,
        confidence_threshold: u8,
    ) -> Self {
        Self {
            token_budget,
            entry_token_cap,
            confidence_threshold,
        }
    }

    pub fn confidence_threshold(&self) -> u8 {
        self.confidence_threshold
    }

    /// Assemble context for the item at `current_index` from every completed
    /// item before it.
    pub fn build_context(
        &self,
        epic_id: &str,
        current_index: usize,
        items: &[WorkItemSummary],
        target: &ContextTarget,
    ) -> BuiltContext {
        let mut planned = self.plan(current_index, items, target);
        let mut entries = self.render_all(&planned);

        // Compression cascade, each stage applied only while over budget.
        if self.total(&entries) > self.token_budget {
            for entry in planned.iter_mut().filter(|p| p.distance >= 7) {
                entry.level = CompressionLevel::MetadataOnly;
            }
            entries = self.render_all(&planned);
        }
        if self.total(&entries) > self.token_budget {
            for entry in planned.iter_mut().filter(|p| (4..=6).contains(&p.distance)) {
                entry.level = CompressionLevel::MetadataOnly;
            }
            entries = self.render_all(&planned);
        }
        if self.total(&entries) > self.token_budget {
            for entry in planned.iter_mut().filter(|p| p.distance <= 3) {
                entry.truncate_notes = true;
            }
            entries = self.render_all(&planned);
        }
        if self.total(&entries) > self.token_budget {
            for entry in planned.iter_mut().filter(|p| p.distance <= 3) {
                entry.drop_rich_fields = true;
            }
            entries = self.render_all(&planned);
        }
        // Hard floor: the budget holds for any item count, so shed the
        // farthest entries once the field cascade is exhausted.
        while self.total(&entries) > self.token_budget && !entries.is_empty() {
            entries.remove(0);
        }

        let total_tokens = self.total(&entries);
        let text = entries
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        debug!(
            epic_id,
            entries = entries.len(),
            total_tokens,
            budget = self.token_budget,
            "context assembled"
        );
        BuiltContext {
            epic_id: epic_id.to_string(),
            entries,
            total_tokens,
            token_budget: self.token_budget,
            text,
        }
    }

    fn plan<'a>(
        &self,
        current_index: usize,
        items: &'a [WorkItemSummary],
        target: &ContextTarget,
    ) -> Vec<Planned<'a>> {
        items
            .iter()
            .enumerate()
            .take(current_index)
            .filter(|(_, item)| item.is_completed())
            .map(|(i, item)| {
                let distance = current_index - i;
                let mut level = CompressionLevel::for_distance(distance);
                // Upgrade-only exception: relevance lifts MetadataOnly one
                // notch, never to FullDetail.
                if level == CompressionLevel::MetadataOnly
                    && (self.files_overlap(item, target) || self.executor_matches(item, target))
                {
                    level = CompressionLevel::MetadataPlusFiles;
                }
                let flagged = item
                    .confidence
                    .is_some_and(|c| c < self.confidence_threshold);
                Planned {
                    item,
                    distance,
                    level,
                    truncate_notes: false,
                    drop_rich_fields: false,
                    flagged,
                }
            })
            .collect()
    }

    fn files_overlap(&self, item: &WorkItemSummary, target: &ContextTarget) -> bool {
        item.files_modified
            .iter()
            .any(|f| target.files_to_modify.contains(f))
    }

    fn executor_matches(&self, item: &WorkItemSummary, target: &ContextTarget) -> bool {
        match (&item.executor, &target.executor) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn render_all(&self, planned: &[Planned<'_>]) -> Vec<ContextEntry> {
        planned
            .iter()
            .map(|p| {
                let mut text = render_entry(p, self.confidence_threshold);
                if estimate_tokens(&text) > self.entry_token_cap {
                    text = truncate_to_tokens(&text, self.entry_token_cap);
                }
                let tokens = estimate_tokens(&text);
                ContextEntry {
                    item_id: p.item.id.clone(),
                    distance: p.distance,
                    level: p.level,
                    flagged: p.flagged,
                    text,
                    tokens,
                }
            })
            .collect()
    }

    fn total(&self, entries: &[ContextEntry]) -> usize {
        entries.iter().map(|e| e.tokens).sum()
    }
}

fn render_entry(p: &Planned<'_>, threshold: u8) -> String {
    let item = p.item;
    let mut lines = vec![format!("## {}: {} [{}]", item.id, item.title, item.status)];
    if let Some(ref executor) = item.executor {
        lines.push(format!("executor: {}", executor));
    }
    if let Some(completed_at) = item.completed_at {
        lines.push(format!(
            "completed: {}",
            completed_at.format("%Y-%m-%d %H:%M UTC")
        ));
    }

    if p.level >= CompressionLevel::MetadataPlusFiles {
        if !item.files_modified.is_empty() {
            lines.push(format!("files: {}", item.files_modified.join(", ")));
        }
        if let Some(ref reviewer) = item.reviewer {
            lines.push(format!("reviewer: {}", reviewer));
        }
        if !item.summary.is_empty() {
            lines.push(format!("summary: {}", item.summary));
        }
    }

    if p.level >= CompressionLevel::FullDetail && !p.drop_rich_fields {
        if !item.acceptance_criteria.is_empty() {
            lines.push("acceptance:".to_string());
            for criterion in &item.acceptance_criteria {
                lines.push(format!("  - {}", criterion));
            }
        }
        if !item.notes.is_empty() {
            let notes = if p.truncate_notes {
                truncate_chars(&item.notes, NOTES_TRUNCATE_CHARS)
            } else {
                item.notes.clone()
            };
            lines.push(format!("notes: {}", notes));
        }
    }
    if p.level >= CompressionLevel::FullDetail && !item.decisions.is_empty() {
        lines.push("decisions:".to_string());
        for decision in &item.decisions {
            lines.push(format!("  - {}", decision));
        }
    }

    if p.flagged
        && let Some(confidence) = item.confidence
    {
        lines.push(format!(
            "flagged: confidence {} below gate threshold {}",
            confidence, threshold
        ));
    }

    lines.join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

/// Cut to at most `cap` estimated tokens, on a char boundary, with a marker
/// tail. The result's estimate never exceeds `cap`.
fn truncate_to_tokens(text: &str, cap: usize) -> String {
    let max_bytes = cap.saturating_mul(4);
    let keep = max_bytes.saturating_sub(TRUNCATION_TAIL.len());
    let mut end = keep.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_TAIL)
}

fn read_confidence_threshold() -> u8 {
    match std::env::var(CONFIDENCE_THRESHOLD_ENV) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| (0..=100).contains(v))
            .map(|v| v as u8)
            .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
        Err(_) => DEFAULT_CONFIDENCE_THRESHOLD,
    }
}
