//! `conductor locks`: list lock records and sweep the stale ones.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::path::Path;

use conductor::config::Config;
use conductor::lock::LockManager;

use crate::LockCommands;

pub fn cmd_locks(
    project_dir: &Path,
    verbose: bool,
    command: Option<LockCommands>,
) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let manager = LockManager::new(&config.locks_dir);
    match command.unwrap_or(LockCommands::List) {
        LockCommands::List => list(&manager),
        LockCommands::Cleanup => cleanup(&manager),
    }
}

fn list(manager: &LockManager) -> Result<()> {
    let locks = manager.list()?;
    if locks.is_empty() {
        println!("No locks held.");
        return Ok(());
    }
    let now = Utc::now();
    for lock in locks {
        let age_secs = now
            .signed_duration_since(lock.record.created_at)
            .num_seconds();
        let stale_note = if lock.stale {
            format!(" {}", style("[stale]").red().bold())
        } else {
            String::new()
        };
        println!(
            "{}  owner '{}'  pid {}  age {}s  ttl {}s{}",
            style(&lock.record.resource).cyan().bold(),
            lock.record.owner,
            lock.record.pid,
            age_secs,
            lock.record.ttl_seconds,
            stale_note
        );
    }
    Ok(())
}

fn cleanup(manager: &LockManager) -> Result<()> {
    let removed = manager.cleanup_stale_locks()?;
    if removed == 0 {
        println!("Nothing to clean up.");
    } else {
        println!(
            "{} Removed {} stale lock record(s).",
            style("✓").green().bold(),
            removed
        );
    }
    Ok(())
}
