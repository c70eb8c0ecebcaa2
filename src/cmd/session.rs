//! `conductor session`: inspect or discard the persisted session record.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use conductor::config::Config;
use conductor::session::SessionStore;

use crate::SessionCommands;

pub fn cmd_session(
    project_dir: &Path,
    verbose: bool,
    command: Option<SessionCommands>,
) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let store = SessionStore::new(&config);
    match command.unwrap_or(SessionCommands::Show) {
        SessionCommands::Show => show(&store),
        SessionCommands::Discard => discard(&store),
    }
}

fn show(store: &SessionStore) -> Result<()> {
    if !store.exists() {
        bail!("No session here. `conductor run` creates one.");
    }
    let state = store.load()?;

    println!(
        "{} '{}' ({}) — {}/{} items done",
        style("Session").bold().underlined(),
        state.epic_title,
        state.epic_id,
        state.progress.done.len(),
        state.total_items
    );
    if let Some(current) = &state.progress.current_item {
        println!("  current item: {}", style(current).cyan());
    }
    for item in &state.progress.done {
        println!("  {} {}", style("✓").green(), item);
    }
    for item in &state.progress.pending {
        println!("  {} {}", style("·").dim(), item);
    }
    if let Some(branch) = &state.context_snapshot.branch {
        println!("  branch: {}", branch);
    }
    if !state.context_snapshot.executor_histogram.is_empty() {
        let histogram: Vec<String> = state
            .context_snapshot
            .executor_histogram
            .iter()
            .map(|(agent, count)| format!("{}×{}", agent, count))
            .collect();
        println!("  executors: {}", histogram.join(", "));
    }

    println!();
    for line in &state.resume_instructions {
        println!("{}", line);
    }

    let crash = store.detect_crash()?;
    if crash.is_crash {
        println!(
            "\n{} This session looks crashed (idle {} min, last action {}). \
             Completed work will be skipped on resume.",
            style("!").red().bold(),
            crash.idle_minutes,
            crash.last_action_type
        );
    }
    Ok(())
}

fn discard(store: &SessionStore) -> Result<()> {
    let archived = store.discard()?;
    println!(
        "{} Session archived to {}. The next `conductor run` starts fresh.",
        style("✓").green().bold(),
        style(archived.display()).cyan()
    );
    Ok(())
}
