//! `conductor status`: one-screen summary of the pipeline run, the session,
//! and any held locks.

use anyhow::{Result, bail};
use chrono::Utc;
use console::style;
use std::path::Path;

use conductor::config::{Config, is_initialized};
use conductor::events::StatusSnapshot;
use conductor::lock::LockManager;
use conductor::pipeline::{EpicStatus, PipelineRun};
use conductor::plan::WorkPlan;
use conductor::session::SessionStore;

pub fn cmd_status(project_dir: &Path, verbose: bool) -> Result<()> {
    if !is_initialized(project_dir) {
        bail!("No conductor state here. Run `conductor init` first.");
    }
    let config = Config::new(project_dir.to_path_buf(), verbose)?;

    print_pipeline_section(&config)?;
    print_session_section(&config);
    print_lock_section(&config)?;
    print_last_event(&config);
    Ok(())
}

fn print_pipeline_section(config: &Config) -> Result<()> {
    println!("{}", style("Pipeline").bold().underlined());
    let plan = match WorkPlan::load(config) {
        Ok(plan) => plan,
        Err(e) => {
            println!("  {}\n", style(format!("{:#}", e)).yellow());
            return Ok(());
        }
    };

    let record_path = config.run_record_path(&plan.epic_id);
    if !record_path.exists() {
        println!(
            "  Epic '{}' ({}): {}\n",
            plan.epic_id,
            plan.epic_title,
            style("not started").dim()
        );
        return Ok(());
    }

    let run = PipelineRun::load(&record_path)?;
    println!(
        "  Epic '{}' ({}): {} [workflow {}]",
        plan.epic_id,
        plan.epic_title,
        style(run.status).bold(),
        style(&run.workflow_id).dim()
    );
    for record in run.epics.values() {
        let status = epic_status_label(record.status);
        let retries = run.attempts(record.number);
        let retry_note = if retries > 1 {
            format!(" ({} attempts)", retries)
        } else {
            String::new()
        };
        let error_note = record
            .error
            .as_deref()
            .map(|e| format!(" — {}", e))
            .unwrap_or_default();
        println!(
            "    {}. {:<14} {}{}{}",
            record.number,
            record.name,
            status,
            style(retry_note).dim(),
            style(error_note).red()
        );
    }
    if !run.error_log.is_empty() {
        println!(
            "  {} {} recorded failure(s); last: {}",
            style("!").yellow().bold(),
            run.error_log.len(),
            run.error_log.last().map(String::as_str).unwrap_or("")
        );
    }
    println!();
    Ok(())
}

fn epic_status_label(status: EpicStatus) -> console::StyledObject<&'static str> {
    match status {
        EpicStatus::Pending => style("pending").dim(),
        EpicStatus::InProgress => style("in progress").cyan(),
        EpicStatus::Completed => style("completed").green(),
        EpicStatus::Skipped => style("skipped").dim(),
        EpicStatus::Failed => style("failed").red().bold(),
    }
}

fn print_session_section(config: &Config) {
    println!("{}", style("Session").bold().underlined());
    let store = SessionStore::new(config);
    if !store.exists() {
        println!("  {}\n", style("no session").dim());
        return;
    }
    match store.load() {
        Ok(state) => {
            for line in &state.resume_instructions {
                println!("  {}", line);
            }
            if let Ok(crash) = store.detect_crash() {
                if crash.is_crash {
                    println!(
                        "  {} looks crashed: idle {} min after {}",
                        style("!").red().bold(),
                        crash.idle_minutes,
                        crash.last_action_type
                    );
                }
            }
        }
        Err(e) => println!("  {}", style(format!("unreadable session: {}", e)).red()),
    }
    println!();
}

fn print_lock_section(config: &Config) -> Result<()> {
    println!("{}", style("Locks").bold().underlined());
    let locks = LockManager::new(&config.locks_dir).list()?;
    if locks.is_empty() {
        println!("  {}\n", style("none held").dim());
        return Ok(());
    }
    for lock in locks {
        let age_secs = Utc::now()
            .signed_duration_since(lock.record.created_at)
            .num_seconds();
        let stale_note = if lock.stale {
            style(" [stale]").red().bold()
        } else {
            style("").dim()
        };
        println!(
            "  {} held by '{}' (pid {}, {}s old, ttl {}s){}",
            style(&lock.record.resource).cyan(),
            lock.record.owner,
            lock.record.pid,
            age_secs,
            lock.record.ttl_seconds,
            stale_note
        );
    }
    println!();
    Ok(())
}

fn print_last_event(config: &Config) {
    let Ok(content) = std::fs::read_to_string(&config.status_file) else {
        return;
    };
    let Ok(snapshot) = serde_json::from_str::<StatusSnapshot>(&content) else {
        return;
    };
    println!(
        "{} {} at {}",
        style("Last event:").bold(),
        snapshot.last_event.kind(),
        snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}
