//! `conductor context`: preview the historical context that would be handed
//! to a pending work item, with per-entry token accounting.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use conductor::conductor_config::ConductorToml;
use conductor::config::Config;
use conductor::context::{ContextAccumulator, ContextTarget};
use conductor::plan::WorkPlan;
use conductor::session::SessionStore;
use conductor::workflow::WorkItem;

use super::run::completed_summaries;

pub fn cmd_context(project_dir: &Path, verbose: bool, item: Option<&str>) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let settings = ConductorToml::load_or_default(&config.settings_file)
        .map_err(anyhow::Error::new)
        .context("Failed to load conductor.toml")?;
    let plan = WorkPlan::load(&config)?;
    let state = SessionStore::new(&config).load().map_err(anyhow::Error::new)?;

    let item_id = match item {
        Some(id) => id.to_string(),
        None => match state.progress.pending.first() {
            Some(next) => next.clone(),
            None => bail!("Every planned item is done; nothing to build context for."),
        },
    };
    let Some(plan_item) = plan.item(&item_id) else {
        bail!("The plan does not define an item '{}'", item_id);
    };
    let work_item = WorkItem::new(&plan_item.id, &plan_item.title, &plan_item.description)
        .auto_assign();

    let summaries = completed_summaries(&config, &plan, &state.progress.done);
    let target = ContextTarget {
        files_to_modify: Vec::new(),
        executor: work_item.assignment.as_ref().map(|a| a.executor.clone()),
    };
    let built = ContextAccumulator::new(&settings.context).build_context(
        &plan.epic_id,
        summaries.len(),
        &summaries,
        &target,
    );

    println!(
        "{} for item {} ({} prior completed items)",
        style("Context").bold().underlined(),
        style(&item_id).cyan(),
        summaries.len()
    );
    for entry in &built.entries {
        let flag = if entry.flagged {
            style(" [flagged]").yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} distance {:<2} {:<20} {:>5} tokens{}",
            style(&entry.item_id).cyan(),
            entry.distance,
            entry.level.to_string(),
            entry.tokens,
            flag
        );
    }
    println!(
        "  total: {} / {} tokens\n",
        style(built.total_tokens).bold(),
        built.token_budget
    );

    if verbose {
        println!("{}", built.text);
    } else {
        let preview: String = built.text.lines().take(12).collect::<Vec<_>>().join("\n");
        println!("{}", preview);
        if built.text.lines().count() > 12 {
            println!("{}", style("… (use --verbose for the full text)").dim());
        }
    }
    Ok(())
}
