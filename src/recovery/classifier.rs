//! Regex-family error classification.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// The failure taxonomy. Each class maps to a recovery strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    State,
    Configuration,
    Dependency,
    Fatal,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::State => "state",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Dependency => "dependency",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Families are checked in declaration order; the first matching family
/// wins, so e.g. "fatal: connection timeout" classifies as transient.
static FAMILIES: LazyLock<Vec<(ErrorClass, RegexSet)>> = LazyLock::new(|| {
    let set = |patterns: &[&str]| {
        RegexSet::new(patterns.iter().map(|p| format!("(?i){}", p)))
            .expect("classifier patterns are valid static regexes")
    };
    vec![
        (
            ErrorClass::Transient,
            set(&[
                r"\btimeout\b",
                r"timed? out",
                r"connection (refused|reset)",
                r"ECONNREFUSED",
                r"ETIMEDOUT",
                r"temporarily unavailable",
                r"rate limit",
                r"\b429\b",
                r"\b503\b",
            ]),
        ),
        (
            ErrorClass::State,
            set(&[
                r"corrupt",
                r"inconsistent",
                r"checksum",
                r"conflict",
                r"out of sync",
                r"invalid state",
                r"version mismatch",
            ]),
        ),
        (
            ErrorClass::Configuration,
            set(&[
                r"missing (config|setting|field)",
                r"not configured",
                r"\bunset\b",
                r"no such (key|option)",
                r"invalid configuration",
            ]),
        ),
        (
            ErrorClass::Dependency,
            set(&[
                r"ENOENT",
                r"not found",
                r"missing (file|dependency|module|binary)",
                r"cannot find",
                r"no such file",
            ]),
        ),
        (
            ErrorClass::Fatal,
            set(&[
                r"\bpanic",
                r"\bfatal\b",
                r"unrecoverable",
                r"assertion failed",
                r"out of memory",
                r"segfault",
            ]),
        ),
    ]
});

/// Classify an error message into the taxonomy.
pub fn classify(message: &str) -> ErrorClass {
    for (class, set) in FAMILIES.iter() {
        if set.is_match(message) {
            return *class;
        }
    }
    ErrorClass::Unknown
}

/// Normalize a message into a signature for circular-approach detection:
/// lowercased, digits and hex runs collapsed, truncated. Two retries of the
/// same failure produce the same signature even when ids or counts differ.
pub fn signature(message: &str) -> String {
    let mut out = String::with_capacity(message.len().min(80));
    let mut last_was_marker = false;
    for c in message.chars() {
        if c.is_ascii_digit() {
            if !last_was_marker {
                out.push('#');
                last_was_marker = true;
            }
        } else {
            out.extend(c.to_lowercase());
            last_was_marker = false;
        }
        if out.len() >= 80 {
            break;
        }
    }
    out
}
