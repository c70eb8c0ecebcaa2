//! Terminal UI for a pipeline run, rendered via `indicatif` progress bars.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

use crate::events::{EventSink, PipelineEvent};
use crate::ui::icons::{
    BLOCKER, CHECK, CHECKPOINT, CROSS, ESCALATION, GATE, RECOVERY, SKIP, SPARKLE,
};

/// Two bars stacked vertically:
/// - Epic bar — tracks how many epics have completed
/// - Phase bar — spinner with the current item, phase, and agent
///
/// All methods coordinate output via `indicatif`'s `MultiProgress`, so bars
/// and printed lines never interleave mid-row.
pub struct ConductorUI {
    multi: MultiProgress,
    epic_bar: ProgressBar,
    phase_bar: ProgressBar,
    verbose: bool,
}

impl ConductorUI {
    /// Create the UI sized to the epic sequence. Call once before the run.
    pub fn new(total_epics: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let epic_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let epic_bar = multi.add(ProgressBar::new(total_epics));
        epic_bar.set_style(epic_style);
        epic_bar.set_prefix("Epics");

        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phase");

        Self {
            multi,
            epic_bar,
            phase_bar,
            verbose,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the
    /// rich UI fails. Critical messages must never be lost silently.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_epic(&self, number: u32, name: &str, attempt: u32) {
        let attempt_note = if attempt > 1 {
            format!(" (attempt {})", attempt)
        } else {
            String::new()
        };
        self.epic_bar.set_message(format!(
            "{}: {}{}",
            style(number).yellow(),
            name,
            style(attempt_note).dim()
        ));
        self.phase_bar.enable_steady_tick(Duration::from_millis(100));
    }

    pub fn epic_complete(&self, number: u32, name: &str) {
        self.epic_bar.inc(1);
        self.print_line(format!(
            "{} Epic {} ({}) complete",
            SPARKLE,
            style(number).green().bold(),
            name
        ));
    }

    pub fn epic_skipped(&self, number: u32, name: &str) {
        self.epic_bar.inc(1);
        self.print_line(format!(
            "{} Epic {} ({}) skipped",
            SKIP,
            style(number).dim(),
            style(name).dim()
        ));
    }

    pub fn start_phase(&self, item: &str, phase: &str, agent: &str) {
        let agent_note = if agent.is_empty() {
            String::new()
        } else {
            format!(" → {}", agent)
        };
        self.phase_bar.set_message(format!(
            "{} / {}{}",
            style(item).cyan(),
            phase,
            style(agent_note).dim()
        ));
    }

    pub fn phase_done(&self, item: &str, phase: &str, status: &str) {
        if self.verbose || status == "failed" {
            let icon = if status == "failed" { CROSS } else { CHECK };
            self.print_line(format!(
                "    {} {} / {} {}",
                icon,
                style(item).cyan(),
                phase,
                style(status).dim()
            ));
        }
    }

    pub fn gate_verdict(&self, epic: u32, verdict: &str, confidence: Option<u8>) {
        let confidence_note = confidence
            .map(|c| format!(" (confidence {})", c))
            .unwrap_or_default();
        let styled = match verdict {
            "pass" => style(verdict.to_string()).green(),
            "blocked" => style(verdict.to_string()).red().bold(),
            _ => style(verdict.to_string()).yellow(),
        };
        self.print_line(format!(
            "    {} Gate for epic {}: {}{}",
            GATE,
            epic,
            styled,
            style(confidence_note).dim()
        ));
    }

    pub fn recovery_selected(&self, epic: u32, strategy: &str, error_class: &str) {
        self.print_line(format!(
            "    {} Epic {} failed ({}) — {}",
            RECOVERY,
            epic,
            style(error_class).dim(),
            style(strategy).yellow()
        ));
    }

    pub fn escalated(&self, epic: u32, report_path: &str) {
        self.print_line(format!(
            "{} {} Epic {} escalated — report at {}",
            ESCALATION,
            style("NEEDS ATTENTION:").red().bold(),
            epic,
            style(report_path).underlined()
        ));
    }

    pub fn pipeline_state(&self, from: &str, to: &str) {
        if to == "Blocked" {
            self.print_line(format!(
                "{} Pipeline {} → {}",
                BLOCKER,
                style(from).dim(),
                style(to).red().bold()
            ));
        } else if self.verbose {
            self.print_line(format!(
                "    Pipeline {} → {}",
                style(from).dim(),
                style(to).cyan()
            ));
        }
    }

    pub fn checkpoint_decided(&self, item: &str, decision: &str) {
        self.print_line(format!(
            "    {} Checkpoint for {}: {}",
            CHECKPOINT,
            style(item).cyan(),
            style(decision).bold()
        ));
    }

    /// Print the banner block before the run begins.
    pub fn print_run_header(&self, work_item: &str, environment: &str) {
        self.print_line("");
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
        self.print_line(format!(
            "{} Conductor run: {}",
            style("▶").green().bold(),
            style(work_item).yellow().bold()
        ));
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
        self.print_line(format!("{}  {}", style("Environment:").dim(), environment));
        self.print_line("");
    }

    pub fn finish(&self, final_state: &str) {
        self.phase_bar.finish_and_clear();
        match final_state {
            "Complete" => self
                .epic_bar
                .finish_with_message(style("all epics complete").green().to_string()),
            other => self
                .epic_bar
                .finish_with_message(style(other.to_string()).red().to_string()),
        }
    }
}

/// Event-bus observer that renders every pipeline event on the terminal UI.
///
/// The UI itself is shared so the command layer can print the run header and
/// the final summary around the event stream.
pub struct UiSink {
    ui: Arc<ConductorUI>,
}

impl UiSink {
    pub fn new(ui: Arc<ConductorUI>) -> Self {
        Self { ui }
    }
}

impl EventSink for UiSink {
    fn on_event(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::PipelineStateChanged { from, to, .. } => {
                self.ui.pipeline_state(from, to);
            }
            PipelineEvent::EpicStarted {
                number,
                name,
                attempt,
            } => {
                self.ui.start_epic(*number, name, *attempt);
            }
            PipelineEvent::EpicCompleted {
                number,
                name,
                status,
            } => match status.as_str() {
                "skipped" => self.ui.epic_skipped(*number, name),
                _ => self.ui.epic_complete(*number, name),
            },
            PipelineEvent::GateEvaluated {
                epic,
                verdict,
                confidence,
            } => {
                self.ui.gate_verdict(*epic, verdict, *confidence);
            }
            PipelineEvent::PhaseStarted { item, phase, agent } => {
                self.ui.start_phase(item, phase, agent);
            }
            PipelineEvent::PhaseCompleted {
                item,
                phase,
                status,
            } => {
                self.ui.phase_done(item, phase, status);
            }
            PipelineEvent::RecoverySelected {
                epic,
                strategy,
                error_class,
            } => {
                self.ui.recovery_selected(*epic, strategy, error_class);
            }
            PipelineEvent::Escalated { epic, report_path } => {
                self.ui.escalated(*epic, report_path);
            }
            PipelineEvent::CheckpointDecision { item, decision } => {
                self.ui.checkpoint_decided(item, decision);
            }
        }
    }
}
