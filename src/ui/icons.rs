//! Shared UI icons and emojis.
//!
//! This module provides common emoji constants used across the UI components
//! for consistent visual styling.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");

// Pipeline indicators
pub static GATE: Emoji<'_, '_> = Emoji("🔍 ", "[GATE]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static RECOVERY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static ESCALATION: Emoji<'_, '_> = Emoji("📣 ", "[ESC]");
pub static CHECKPOINT: Emoji<'_, '_> = Emoji("⏸️  ", "[HOLD]");
