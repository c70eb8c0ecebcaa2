//! Token-bounded historical context for the current work item.
//!
//! Prior completed items are summarized at a compression level chosen by
//! how far back they are, then squeezed through a staged cascade until the
//! whole assembly fits the token budget. Everything here is deterministic:
//! the same inputs always produce byte-identical context.

mod accumulator;

pub use accumulator::{BuiltContext, ContextAccumulator, ContextEntry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assignment::AgentId;

/// How much of an item's record survives into the context.
///
/// Ordered by detail: `MetadataOnly < MetadataPlusFiles < FullDetail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    MetadataOnly,
    MetadataPlusFiles,
    FullDetail,
}

impl CompressionLevel {
    /// Base level by distance from the current item.
    pub fn for_distance(distance: usize) -> Self {
        match distance {
            0..=3 => CompressionLevel::FullDetail,
            4..=6 => CompressionLevel::MetadataPlusFiles,
            _ => CompressionLevel::MetadataOnly,
        }
    }
}

impl std::fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionLevel::MetadataOnly => "metadata_only",
            CompressionLevel::MetadataPlusFiles => "metadata_plus_files",
            CompressionLevel::FullDetail => "full_detail",
        };
        write!(f, "{}", s)
    }
}

/// Everything the accumulator may reveal about one completed item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemSummary {
    pub id: String,
    pub title: String,
    pub executor: Option<AgentId>,
    pub reviewer: Option<AgentId>,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Gate confidence recorded when the item passed (0-100).
    #[serde(default)]
    pub confidence: Option<u8>,
}

impl WorkItemSummary {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// What the current item is about, for upgrade decisions.
#[derive(Debug, Clone, Default)]
pub struct ContextTarget {
    pub files_to_modify: Vec<String>,
    pub executor: Option<AgentId>,
}

/// Deterministic token estimate: `ceil(chars / 4)`. An approximation, not a
/// tokenizer, but reproducible byte-for-byte.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
