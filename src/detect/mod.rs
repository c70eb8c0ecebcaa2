//! Tech-stack detection for pipeline pre-flight.
//!
//! Pure filesystem probing: marker files at the project root plus a shallow
//! walk for source extensions. The resulting profile is stored on the
//! persisted run so a resumed pipeline knows what environment it detected
//! the first time around.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

/// How deep the source-extension walk goes.
const SCAN_DEPTH: usize = 3;

/// Detected environment for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechProfile {
    /// Stacks recognized from marker files, e.g. "rust", "node".
    pub stacks: Vec<String>,
    /// Languages inferred from source extensions.
    pub languages: Vec<String>,
    pub has_git: bool,
    pub has_ci: bool,
    pub has_docker: bool,
    pub has_tests: bool,
}

impl TechProfile {
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty() && self.languages.is_empty()
    }

    /// One-line rendering for logs and the status command.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no recognized stack".to_string();
        }
        let mut parts = Vec::new();
        if !self.stacks.is_empty() {
            parts.push(self.stacks.join("+"));
        }
        if self.has_docker {
            parts.push("docker".to_string());
        }
        if self.has_ci {
            parts.push("ci".to_string());
        }
        parts.join(", ")
    }
}

/// Marker file at the project root → stack name.
const STACK_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("go.mod", "go"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
    ("Gemfile", "ruby"),
    ("composer.json", "php"),
    ("mix.exs", "elixir"),
];

/// Source extension → language name.
const LANGUAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("py", "python"),
    ("go", "go"),
    ("java", "java"),
    ("rb", "ruby"),
    ("ex", "elixir"),
    ("php", "php"),
    ("sql", "sql"),
];

/// Probe `project_dir` and build its profile. Never fails; an unreadable
/// directory just yields an empty profile.
pub fn detect_project(project_dir: &Path) -> TechProfile {
    let mut stacks = BTreeSet::new();
    for (marker, stack) in STACK_MARKERS {
        if project_dir.join(marker).exists() {
            stacks.insert(stack.to_string());
        }
    }

    let mut languages = BTreeSet::new();
    let mut has_tests = false;
    for entry in WalkDir::new(project_dir)
        .max_depth(SCAN_DEPTH)
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e.path()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if name == "tests" || name == "test" || name == "__tests__" {
                has_tests = true;
            }
            continue;
        }
        if let Some(ext) = entry.path().extension().and_then(|e| e.to_str())
            && let Some((_, language)) = LANGUAGE_EXTENSIONS.iter().find(|(e, _)| *e == ext)
        {
            languages.insert(language.to_string());
        }
    }

    TechProfile {
        stacks: stacks.into_iter().collect(),
        languages: languages.into_iter().collect(),
        has_git: project_dir.join(".git").exists(),
        has_ci: project_dir.join(".github/workflows").is_dir()
            || project_dir.join(".gitlab-ci.yml").exists(),
        has_docker: project_dir.join("Dockerfile").exists()
            || project_dir.join("docker-compose.yml").exists(),
        has_tests,
    }
}

fn is_ignored_dir(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some(".git") | Some("node_modules") | Some("target") | Some(".conductor")
    )
}
