//! Unified settings system for Conductor.
//!
//! Reads `.conductor/conductor.toml` and layers it with environment
//! variables and CLI flags (file → environment → CLI). Runtime paths live in
//! [`crate::config::Config`]; this module is behavioral knobs only.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [defaults]
//! max_retries = 3
//! auto_escalate = true
//! agent_timeout_secs = 1800
//! parallel_limit = 4
//!
//! [healing]
//! enabled = false
//! max_iterations = 3
//! min_severity = "medium"
//!
//! [context]
//! token_budget = 8000
//! entry_token_cap = 1500
//!
//! [gate]
//! pass_threshold = 70
//!
//! [epics.overrides.execution]
//! max_retries = 5
//! auto_escalate = false
//!
//! [epics.overrides.publication]
//! skip_when = "ci && (dry_run || offline)"
//! ```
//!
//! Epic overrides are keyed by epic slug (case-insensitive) or epic number.
//! `skip_when` conditions use a small boolean expression grammar over project
//! flags; an expression mixing `&&` and `||` without parentheses is rejected
//! at load time rather than guessed at.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::SettingsError;
use crate::workflow::healing::FindingSeverity;

/// Project-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Default knobs applied to every epic unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Retry ceiling per epic before the recovery handler escalates
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether exhausted or fatal failures escalate to a human report
    #[serde(default = "default_auto_escalate")]
    pub auto_escalate: bool,
    /// Wall-clock ceiling for a single agent invocation
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Requested parallel agent fan-out (hard-capped by the executor)
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_auto_escalate() -> bool {
    true
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

fn default_parallel_limit() -> usize {
    4
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            auto_escalate: default_auto_escalate(),
            agent_timeout_secs: default_agent_timeout_secs(),
            parallel_limit: default_parallel_limit(),
        }
    }
}

/// Self-healing phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSection {
    /// Whether the self-healing phase runs at all
    #[serde(default)]
    pub enabled: bool,
    /// Iteration ceiling per work item
    #[serde(default = "default_healing_iterations")]
    pub max_iterations: u32,
    /// Findings below this severity are ignored
    #[serde(default)]
    pub min_severity: FindingSeverity,
}

fn default_healing_iterations() -> u32 {
    3
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_healing_iterations(),
            min_severity: FindingSeverity::default(),
        }
    }
}

/// Context accumulator budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Global token budget for one assembled context
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Per-entry token ceiling before truncation
    #[serde(default = "default_entry_token_cap")]
    pub entry_token_cap: usize,
}

fn default_token_budget() -> usize {
    8000
}

fn default_entry_token_cap() -> usize {
    1500
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            entry_token_cap: default_entry_token_cap(),
        }
    }
}

/// Quality-gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSection {
    /// Minimum confidence (0-100) for a Pass verdict
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u8,
}

fn default_pass_threshold() -> u8 {
    70
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
        }
    }
}

/// Per-epic override settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpicOverride {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub auto_escalate: Option<bool>,
    #[serde(default)]
    pub healing_enabled: Option<bool>,
    #[serde(default)]
    pub token_budget: Option<usize>,
    #[serde(default)]
    pub pass_threshold: Option<u8>,
    /// Boolean expression over project flags; truthy means skip the epic
    #[serde(default)]
    pub skip_when: Option<String>,
}

/// Epic override configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpicsConfig {
    /// Keyed by epic slug ("execution") or epic number ("3")
    #[serde(default)]
    pub overrides: HashMap<String, EpicOverride>,
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub healing: HealingSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub epics: EpicsConfig,
}

impl ConductorToml {
    /// Load settings from a TOML file, rejecting malformed skip conditions.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| SettingsError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content, path)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str, path: &Path) -> Result<Self, SettingsError> {
        let toml: Self =
            toml::from_str(content).map_err(|source| SettingsError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        toml.validate()?;
        Ok(toml)
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save settings to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        Ok(())
    }

    /// Reject every `skip_when` expression the condition grammar cannot parse.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for override_cfg in self.epics.overrides.values() {
            if let Some(ref expr) = override_cfg.skip_when {
                condition::parse(expr)?;
            }
        }
        Ok(())
    }

    /// Soft configuration problems worth surfacing but not fatal.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.gate.pass_threshold > 100 {
            warnings.push(format!(
                "gate.pass_threshold {} exceeds 100 and will be clamped",
                self.gate.pass_threshold
            ));
        }
        for (key, override_cfg) in &self.epics.overrides {
            if let Some(threshold) = override_cfg.pass_threshold
                && threshold > 100
            {
                warnings.push(format!(
                    "pass_threshold {} in override for epic '{}' exceeds 100",
                    threshold, key
                ));
            }
        }
        warnings
    }

    /// Whether escalation is enabled (environment can override the file).
    pub fn auto_escalate(&self) -> bool {
        if let Ok(env_val) = std::env::var("CONDUCTOR_AUTO_ESCALATE") {
            return env_val != "false" && env_val != "0";
        }
        self.defaults.auto_escalate
    }

    /// Effective settings for one epic, applying any matching override.
    ///
    /// Overrides match on the epic slug (case-insensitive) or the epic
    /// number rendered as a string.
    pub fn epic_settings(&self, number: u8, slug: &str) -> EpicSettings {
        let mut settings = EpicSettings {
            max_retries: self.defaults.max_retries,
            auto_escalate: self.auto_escalate(),
            healing_enabled: self.healing.enabled,
            token_budget: self.context.token_budget,
            pass_threshold: self.gate.pass_threshold.min(100),
            skip_when: None,
        };

        let number_key = number.to_string();
        for (key, override_cfg) in &self.epics.overrides {
            if !key.eq_ignore_ascii_case(slug) && *key != number_key {
                continue;
            }
            if let Some(max_retries) = override_cfg.max_retries {
                settings.max_retries = max_retries;
            }
            if let Some(auto_escalate) = override_cfg.auto_escalate {
                settings.auto_escalate = auto_escalate;
            }
            if let Some(healing_enabled) = override_cfg.healing_enabled {
                settings.healing_enabled = healing_enabled;
            }
            if let Some(token_budget) = override_cfg.token_budget {
                settings.token_budget = token_budget;
            }
            if let Some(pass_threshold) = override_cfg.pass_threshold {
                settings.pass_threshold = pass_threshold.min(100);
            }
            if let Some(ref skip_when) = override_cfg.skip_when {
                settings.skip_when = Some(skip_when.clone());
            }
        }

        settings
    }

    /// Starter file written by `conductor init`.
    pub fn starter_toml(project_name: &str) -> String {
        format!(
            r#"# Conductor settings. Every key is optional; defaults shown.

[project]
name = "{project_name}"

[defaults]
max_retries = 3
auto_escalate = true
agent_timeout_secs = 1800
parallel_limit = 4

[healing]
enabled = false
max_iterations = 3
min_severity = "medium"

[context]
token_budget = 8000
entry_token_cap = 1500

[gate]
pass_threshold = 70

# Per-epic overrides, keyed by slug or number:
#
# [epics.overrides.execution]
# max_retries = 5
"#
        )
    }
}

/// Resolved settings for one epic.
#[derive(Debug, Clone)]
pub struct EpicSettings {
    pub max_retries: u32,
    pub auto_escalate: bool,
    pub healing_enabled: bool,
    pub token_budget: usize,
    pub pass_threshold: u8,
    /// Validated at load time; evaluate with [`condition::eval`]
    pub skip_when: Option<String>,
}

/// Boolean skip-condition grammar.
///
/// ```text
/// expr    := operand (("&&" | "||") operand)*   -- one operator kind per level
/// operand := "!"* (flag | "(" expr ")")
/// flag    := [A-Za-z0-9_-]+
/// ```
///
/// `a && b || c` is ambiguous under this grammar and rejected; write
/// `(a && b) || c`. Flags not present in the evaluation set are false.
pub mod condition {
    use super::SettingsError;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Expr {
        Flag(String),
        Not(Box<Expr>),
        All(Vec<Expr>),
        Any(Vec<Expr>),
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Flag(String),
        And,
        Or,
        Not,
        Open,
        Close,
    }

    /// Parse an expression, rejecting unparenthesized `&&`/`||` mixes.
    pub fn parse(expr: &str) -> Result<Expr, SettingsError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err(invalid(expr, "empty expression"));
        }
        let mut pos = 0;
        let parsed = parse_expr(expr, &tokens, &mut pos)?;
        if pos != tokens.len() {
            return Err(invalid(expr, "unbalanced ')'"));
        }
        Ok(parsed)
    }

    /// Evaluate an expression against a set of project flags.
    pub fn eval(expr: &str, flags: &HashMap<String, bool>) -> Result<bool, SettingsError> {
        Ok(eval_node(&parse(expr)?, flags))
    }

    fn eval_node(node: &Expr, flags: &HashMap<String, bool>) -> bool {
        match node {
            Expr::Flag(name) => flags.get(name).copied().unwrap_or(false),
            Expr::Not(inner) => !eval_node(inner, flags),
            Expr::All(nodes) => nodes.iter().all(|n| eval_node(n, flags)),
            Expr::Any(nodes) => nodes.iter().any(|n| eval_node(n, flags)),
        }
    }

    fn tokenize(expr: &str) -> Result<Vec<Token>, SettingsError> {
        let mut tokens = Vec::new();
        let mut chars = expr.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                ' ' | '\t' => {
                    chars.next();
                }
                '(' => {
                    chars.next();
                    tokens.push(Token::Open);
                }
                ')' => {
                    chars.next();
                    tokens.push(Token::Close);
                }
                '!' => {
                    chars.next();
                    tokens.push(Token::Not);
                }
                '&' | '|' => {
                    chars.next();
                    if chars.next() != Some(c) {
                        return Err(invalid(expr, &format!("single '{}' (use {0}{0})", c)));
                    }
                    tokens.push(if c == '&' { Token::And } else { Token::Or });
                }
                c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                    let mut flag = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                            flag.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Flag(flag));
                }
                other => return Err(invalid(expr, &format!("unexpected character '{}'", other))),
            }
        }
        Ok(tokens)
    }

    fn parse_expr(expr: &str, tokens: &[Token], pos: &mut usize) -> Result<Expr, SettingsError> {
        let mut operands = vec![parse_operand(expr, tokens, pos)?];
        let mut operator: Option<Token> = None;

        while let Some(tok @ (Token::And | Token::Or)) = tokens.get(*pos) {
            match &operator {
                None => operator = Some(tok.clone()),
                Some(seen) if seen != tok => {
                    return Err(SettingsError::AmbiguousCondition {
                        expr: expr.to_string(),
                    });
                }
                Some(_) => {}
            }
            *pos += 1;
            operands.push(parse_operand(expr, tokens, pos)?);
        }

        Ok(match operator {
            None => operands.remove(0),
            Some(Token::And) => Expr::All(operands),
            Some(_) => Expr::Any(operands),
        })
    }

    fn parse_operand(expr: &str, tokens: &[Token], pos: &mut usize) -> Result<Expr, SettingsError> {
        match tokens.get(*pos) {
            Some(Token::Not) => {
                *pos += 1;
                Ok(Expr::Not(Box::new(parse_operand(expr, tokens, pos)?)))
            }
            Some(Token::Flag(name)) => {
                *pos += 1;
                Ok(Expr::Flag(name.clone()))
            }
            Some(Token::Open) => {
                *pos += 1;
                let inner = parse_expr(expr, tokens, pos)?;
                match tokens.get(*pos) {
                    Some(Token::Close) => {
                        *pos += 1;
                        Ok(inner)
                    }
                    _ => Err(invalid(expr, "missing ')'")),
                }
            }
            Some(Token::Close) => Err(invalid(expr, "unexpected ')'")),
            Some(Token::And) | Some(Token::Or) => Err(invalid(expr, "operator without operand")),
            None => Err(invalid(expr, "expression ends after operator")),
        }
    }

    fn invalid(expr: &str, reason: &str) -> SettingsError {
        SettingsError::InvalidCondition {
            expr: expr.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn parse(content: &str) -> Result<ConductorToml, SettingsError> {
        ConductorToml::parse(content, &PathBuf::from("conductor.toml"))
    }

    // =========================================
    // Parsing and defaults
    // =========================================

    #[test]
    fn test_parse_empty_yields_defaults() {
        let toml = parse("").unwrap();
        assert_eq!(toml.defaults.max_retries, 3);
        assert!(toml.defaults.auto_escalate);
        assert_eq!(toml.defaults.agent_timeout_secs, 1800);
        assert_eq!(toml.defaults.parallel_limit, 4);
        assert!(!toml.healing.enabled);
        assert_eq!(toml.healing.max_iterations, 3);
        assert_eq!(toml.context.token_budget, 8000);
        assert_eq!(toml.context.entry_token_cap, 1500);
        assert_eq!(toml.gate.pass_threshold, 70);
    }

    #[test]
    fn test_parse_full_sections() {
        let content = r#"
[project]
name = "orchestrated-app"

[defaults]
max_retries = 5
auto_escalate = false
agent_timeout_secs = 600
parallel_limit = 2

[healing]
enabled = true
max_iterations = 2
min_severity = "high"

[context]
token_budget = 4000
entry_token_cap = 800

[gate]
pass_threshold = 85
"#;
        let toml = parse(content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("orchestrated-app"));
        assert_eq!(toml.defaults.max_retries, 5);
        assert!(!toml.defaults.auto_escalate);
        assert_eq!(toml.defaults.agent_timeout_secs, 600);
        assert_eq!(toml.defaults.parallel_limit, 2);
        assert!(toml.healing.enabled);
        assert_eq!(toml.healing.max_iterations, 2);
        assert_eq!(toml.healing.min_severity, FindingSeverity::High);
        assert_eq!(toml.context.token_budget, 4000);
        assert_eq!(toml.gate.pass_threshold, 85);
    }

    #[test]
    fn test_parse_malformed_toml_is_parse_failed() {
        let result = parse("[defaults]\nmax_retries = \"not a number\"");
        assert!(matches!(result, Err(SettingsError::ParseFailed { .. })));
    }

    // =========================================
    // Epic overrides
    // =========================================

    #[test]
    fn test_epic_settings_no_override() {
        let toml = ConductorToml::default();
        let settings = toml.epic_settings(3, "execution");
        assert_eq!(settings.max_retries, 3);
        assert!(!settings.healing_enabled);
        assert!(settings.skip_when.is_none());
    }

    #[test]
    fn test_epic_settings_override_by_slug() {
        let content = r#"
[epics.overrides.execution]
max_retries = 7
healing_enabled = true
"#;
        let toml = parse(content).unwrap();

        let execution = toml.epic_settings(3, "execution");
        assert_eq!(execution.max_retries, 7);
        assert!(execution.healing_enabled);

        let quality = toml.epic_settings(4, "quality");
        assert_eq!(quality.max_retries, 3);
        assert!(!quality.healing_enabled);
    }

    #[test]
    fn test_epic_settings_override_by_number_and_case() {
        let content = r#"
[epics.overrides.5]
skip_when = "offline"

[epics.overrides.QUALITY]
pass_threshold = 90
"#;
        let toml = parse(content).unwrap();
        assert_eq!(
            toml.epic_settings(5, "publication").skip_when.as_deref(),
            Some("offline")
        );
        assert_eq!(toml.epic_settings(4, "quality").pass_threshold, 90);
    }

    #[test]
    fn test_epic_settings_clamps_threshold() {
        let content = r#"
[gate]
pass_threshold = 200
"#;
        let toml = parse(content).unwrap();
        assert_eq!(toml.epic_settings(1, "specification").pass_threshold, 100);
        assert_eq!(toml.warnings().len(), 1);
    }

    // =========================================
    // Skip-condition grammar
    // =========================================

    #[test]
    fn test_condition_single_flag() {
        let mut flags = HashMap::new();
        flags.insert("ci".to_string(), true);
        assert!(condition::eval("ci", &flags).unwrap());
        assert!(!condition::eval("offline", &flags).unwrap());
    }

    #[test]
    fn test_condition_and_or_not() {
        let mut flags = HashMap::new();
        flags.insert("ci".to_string(), true);
        flags.insert("offline".to_string(), false);
        assert!(!condition::eval("ci && offline", &flags).unwrap());
        assert!(condition::eval("ci || offline", &flags).unwrap());
        assert!(condition::eval("ci && !offline", &flags).unwrap());
    }

    #[test]
    fn test_condition_parenthesized_mix() {
        let mut flags = HashMap::new();
        flags.insert("a".to_string(), false);
        flags.insert("b".to_string(), true);
        flags.insert("c".to_string(), true);
        assert!(condition::eval("(a && b) || c", &flags).unwrap());
        assert!(!condition::eval("a && (b || c)", &flags).unwrap());
    }

    #[test]
    fn test_condition_unparenthesized_mix_rejected() {
        let result = condition::parse("a && b || c");
        assert!(matches!(
            result,
            Err(SettingsError::AmbiguousCondition { .. })
        ));
    }

    #[test]
    fn test_condition_invalid_inputs() {
        for expr in ["", "a &&", "&& a", "(a", "a)", "a & b", "a # b"] {
            let result = condition::parse(expr);
            assert!(
                matches!(result, Err(SettingsError::InvalidCondition { .. })),
                "expected InvalidCondition for {:?}, got {:?}",
                expr,
                result
            );
        }
    }

    #[test]
    fn test_skip_when_validated_at_load() {
        let content = r#"
[epics.overrides.publication]
skip_when = "ci && dry_run || offline"
"#;
        let result = parse(content);
        assert!(matches!(
            result,
            Err(SettingsError::AmbiguousCondition { .. })
        ));
    }

    // =========================================
    // File I/O and layering
    // =========================================

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = ConductorToml::load_or_default(&dir.path().join("conductor.toml")).unwrap();
        assert_eq!(toml.defaults.max_retries, 3);
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor.toml");

        let mut toml = ConductorToml::default();
        toml.project.name = Some("round-trip".to_string());
        toml.defaults.max_retries = 9;
        toml.save(&path).unwrap();

        let loaded = ConductorToml::load(&path).unwrap();
        assert_eq!(loaded.project.name.as_deref(), Some("round-trip"));
        assert_eq!(loaded.defaults.max_retries, 9);
    }

    #[test]
    fn test_auto_escalate_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("CONDUCTOR_AUTO_ESCALATE").ok();

        unsafe { std::env::remove_var("CONDUCTOR_AUTO_ESCALATE") };
        let toml = ConductorToml::default();
        assert!(toml.auto_escalate());

        unsafe { std::env::set_var("CONDUCTOR_AUTO_ESCALATE", "false") };
        assert!(!toml.auto_escalate());

        match saved {
            Some(val) => unsafe { std::env::set_var("CONDUCTOR_AUTO_ESCALATE", val) },
            None => unsafe { std::env::remove_var("CONDUCTOR_AUTO_ESCALATE") },
        }
    }

    #[test]
    fn test_starter_toml_parses_clean() {
        let content = ConductorToml::starter_toml("demo");
        let toml = parse(&content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("demo"));
        assert!(toml.validate().is_ok());
        assert!(toml.warnings().is_empty());
    }
}
