//! Deterministic work-item assignment.
//!
//! Maps unstructured work-item text to a category by weighted keyword
//! scoring, then to a fixed `{executor, reviewer, review_tools}` triple.
//! Pure functions over a static table; the pipeline and workflow engine
//! both resolve agents through here so the same text always produces the
//! same pair.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Identifier of an agent persona, e.g. `@dev` or `@data-engineer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Work-item categories, in tie-break declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    GeneralCode,
    Database,
    Infrastructure,
    UiUx,
    Research,
    Architecture,
}

impl Category {
    pub fn slug(&self) -> &'static str {
        match self {
            Category::GeneralCode => "general_code",
            Category::Database => "database",
            Category::Infrastructure => "infrastructure",
            Category::UiUx => "ui_ux",
            Category::Research => "research",
            Category::Architecture => "architecture",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// Resolved executor/reviewer pair for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub executor: AgentId,
    pub reviewer: AgentId,
    pub review_tools: Vec<String>,
}

struct CategoryRule {
    category: Category,
    keywords: Vec<(Regex, u32)>,
    assignment: Assignment,
}

fn keyword(word: &str, weight: u32) -> (Regex, u32) {
    // Literal words only, so the compile cannot fail.
    let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).unwrap();
    (pattern, weight)
}

fn rule(
    category: Category,
    keywords: Vec<(Regex, u32)>,
    executor: &str,
    reviewer: &str,
    review_tools: &[&str],
) -> CategoryRule {
    assert!(
        executor != reviewer,
        "assignment table: category {} assigns {} as both executor and reviewer",
        category,
        executor
    );
    CategoryRule {
        category,
        keywords,
        assignment: Assignment {
            executor: AgentId::new(executor),
            reviewer: AgentId::new(reviewer),
            review_tools: review_tools.iter().map(|t| t.to_string()).collect(),
        },
    }
}

static RULES: LazyLock<Vec<CategoryRule>> = LazyLock::new(|| {
    vec![
        rule(
            Category::GeneralCode,
            vec![
                keyword("implement", 2),
                keyword("bug", 2),
                keyword("fix", 2),
                keyword("endpoint", 2),
                keyword("crud", 2),
                keyword("api", 1),
                keyword("handler", 1),
                keyword("feature", 1),
                keyword("test", 1),
            ],
            "@dev",
            "@qa",
            &["lint", "unit-tests"],
        ),
        rule(
            Category::Database,
            vec![
                keyword("rls", 3),
                keyword("database", 3),
                keyword("schema", 2),
                keyword("migration", 2),
                keyword("sql", 2),
                keyword("postgres", 2),
                keyword("supabase", 2),
                keyword("query", 2),
                keyword("index", 1),
                keyword("table", 1),
            ],
            "@data-engineer",
            "@dev",
            &["schema-review", "rls-audit"],
        ),
        rule(
            Category::Infrastructure,
            vec![
                keyword("deploy", 3),
                keyword("docker", 3),
                keyword("kubernetes", 3),
                keyword("k8s", 3),
                keyword("terraform", 3),
                keyword("provision", 2),
                keyword("helm", 2),
                keyword("infra", 2),
                keyword("ci", 2),
                keyword("aws", 2),
            ],
            "@devops",
            "@architect",
            &["config-audit", "deploy-dry-run"],
        ),
        rule(
            Category::UiUx,
            vec![
                keyword("accessibility", 3),
                keyword("figma", 3),
                keyword("wireframe", 3),
                keyword("ui", 2),
                keyword("ux", 2),
                keyword("css", 2),
                keyword("layout", 2),
                keyword("styling", 2),
                keyword("responsive", 2),
                keyword("modal", 1),
            ],
            "@ux-expert",
            "@dev",
            &["accessibility-scan", "visual-diff"],
        ),
        rule(
            Category::Research,
            vec![
                keyword("feasibility", 3),
                keyword("research", 3),
                keyword("investigate", 2),
                keyword("benchmark", 2),
                keyword("compare", 2),
                keyword("evaluate", 2),
                keyword("spike", 2),
                keyword("explore", 2),
                keyword("analysis", 2),
            ],
            "@analyst",
            "@architect",
            &["source-check"],
        ),
        rule(
            Category::Architecture,
            vec![
                keyword("architecture", 3),
                keyword("adr", 3),
                keyword("decouple", 2),
                keyword("modularize", 2),
                keyword("restructure", 2),
                keyword("scalability", 2),
                keyword("refactor", 2),
                keyword("boundary", 1),
            ],
            "@architect",
            "@dev",
            &["design-review", "dependency-graph"],
        ),
    ]
});

/// Score every category against the text, in declaration order.
pub fn scores(text: &str) -> Vec<(Category, u32)> {
    RULES
        .iter()
        .map(|rule| {
            let score = rule
                .keywords
                .iter()
                .map(|(pattern, weight)| pattern.find_iter(text).count() as u32 * weight)
                .sum();
            (rule.category, score)
        })
        .collect()
}

/// Classify work-item text into a category.
///
/// Highest weighted keyword score wins; ties (including the all-zero tie)
/// go to the earliest declared category, so unrecognized text falls back to
/// [`Category::GeneralCode`].
pub fn classify(text: &str) -> Category {
    let scored = scores(text);
    let mut best = scored[0];
    for candidate in &scored[1..] {
        if candidate.1 > best.1 {
            best = *candidate;
        }
    }
    best.0
}

// RULES is declared in Category order.
fn rule_index(category: Category) -> usize {
    match category {
        Category::GeneralCode => 0,
        Category::Database => 1,
        Category::Infrastructure => 2,
        Category::UiUx => 3,
        Category::Research => 4,
        Category::Architecture => 5,
    }
}

/// Look up the fixed assignment for a category.
pub fn assign(category: Category) -> &'static Assignment {
    &RULES[rule_index(category)].assignment
}

/// Classify text and resolve its assignment in one call.
pub fn assign_from_text(text: &str) -> (Category, &'static Assignment) {
    let category = classify(text);
    (category, assign(category))
}
