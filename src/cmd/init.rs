//! `conductor init`: create the `.conductor/` state directory with starter
//! settings and an example work plan.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use tracing::info;

use conductor::conductor_config::ConductorToml;
use conductor::config::Config;
use conductor::detect::detect_project;
use conductor::plan::WorkPlan;

pub fn cmd_init(project_dir: &Path, verbose: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    config.ensure_directories()?;

    let project_name = config
        .project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    if config.settings_file.exists() {
        println!(
            "{} {} already exists, leaving it alone",
            style("→").cyan(),
            config.settings_file.display()
        );
    } else {
        std::fs::write(
            &config.settings_file,
            ConductorToml::starter_toml(&project_name),
        )
        .with_context(|| {
            format!("Failed to write {}", config.settings_file.display())
        })?;
        println!(
            "{} wrote starter settings to {}",
            style("✓").green().bold(),
            config.settings_file.display()
        );
    }

    let plan_path = WorkPlan::path(&config);
    if plan_path.exists() {
        println!(
            "{} {} already exists, leaving it alone",
            style("→").cyan(),
            plan_path.display()
        );
    } else {
        let starter = WorkPlan::starter(&project_name);
        let json = serde_json::to_string_pretty(&starter)?;
        std::fs::write(&plan_path, json)
            .with_context(|| format!("Failed to write {}", plan_path.display()))?;
        println!(
            "{} wrote an example work plan to {}",
            style("✓").green().bold(),
            plan_path.display()
        );
    }

    let profile = detect_project(&config.project_dir);
    info!(environment = %profile.summary(), "project initialized");
    println!(
        "\n{} Initialized {} ({}).",
        style("✓").green().bold(),
        style(&project_name).yellow(),
        profile.summary()
    );
    println!(
        "Edit {} with your epic's items, then run {}.",
        style(plan_path.display()).cyan(),
        style("conductor run").bold()
    );
    Ok(())
}
