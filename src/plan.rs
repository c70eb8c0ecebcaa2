//! The work plan: one epic and its ordered work items.
//!
//! Lives at `.conductor/plan.json`, written by the operator or an upstream
//! planner. `conductor run` refuses to start without it.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::config::Config;

/// One work item in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// The epic and its item list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    pub epic_id: String,
    pub epic_title: String,
    pub items: Vec<PlanItem>,
}

impl WorkPlan {
    pub fn path(config: &Config) -> PathBuf {
        config.state_dir.join("plan.json")
    }

    pub fn load(config: &Config) -> Result<Self> {
        let path = Self::path(config);
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "No work plan at {}. Write a plan.json with the epic and its items first.",
                path.display()
            )
        })?;
        let plan: Self = serde_json::from_str(&content)
            .with_context(|| format!("Work plan at {} is not valid JSON", path.display()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Non-empty epic id, at least one item, unique item ids.
    pub fn validate(&self) -> Result<()> {
        if self.epic_id.trim().is_empty() {
            bail!("Work plan has an empty epic_id");
        }
        if self.items.is_empty() {
            bail!("Work plan '{}' has no items", self.epic_id);
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.id.trim().is_empty() {
                bail!("Work plan '{}' contains an item with an empty id", self.epic_id);
            }
            if !seen.insert(item.id.as_str()) {
                bail!("Work plan '{}' repeats item id '{}'", self.epic_id, item.id);
            }
        }
        Ok(())
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn item(&self, id: &str) -> Option<&PlanItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Example plan written by `conductor init` as a starting point.
    pub fn starter(project_name: &str) -> Self {
        Self {
            epic_id: format!("{}-epic-1", project_name),
            epic_title: "First epic".to_string(),
            items: vec![PlanItem {
                id: "item-1".to_string(),
                title: "Describe the first work item".to_string(),
                description: "Replace this with what the item should accomplish.".to_string(),
            }],
        }
    }
}
