//! Progress reporting for the coordinator
//!
//! Provides a stage progress bar using indicatif and a styled run summary.

use crate::fleet::{RoundEvent, RunSummary};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar over the stage list
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a progress reporter for `stages` stages
    pub fn new(stages: usize) -> Self {
        let bar = ProgressBar::new(stages as u64);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .expect("Invalid progress template")
                .progress_chars("=> ")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Update the display for one round event
    pub fn observe(&self, event: &RoundEvent) {
        match event {
            RoundEvent::StageStarted { index, name } => {
                self.bar.set_message(format!("Stage {} ({})", index, name));
            }
            RoundEvent::StageFinished { .. } => self.bar.inc(1),
            RoundEvent::SyncStarted { after } => {
                self.bar.set_message(format!("Syncing after stage {}", after));
            }
            RoundEvent::SyncFinished { .. } => {}
            RoundEvent::Interrupted { skipped } => {
                self.bar
                    .set_message(format!("Interrupted, skipping {} stages", skipped));
            }
            RoundEvent::ShuttingDown => self.bar.set_message("Shutting down fleet"),
        }
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Format a duration as `1h02m03s`, `2m05s` or `4.2s`
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// Print a summary of the run
pub fn print_summary(summary: &RunSummary, total_stages: usize) {
    let title = if summary.interrupted {
        style("Run Interrupted").yellow().bold()
    } else if summary.fleet.all_succeeded() {
        style("Run Complete").green().bold()
    } else {
        style("Run Complete With Worker Failures").red().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Run id:").bold(), summary.run_id);
    println!("  {} {}", style("Workers:").bold(), summary.fleet_size);
    println!(
        "  {} {}/{}",
        style("Stages:").bold(),
        summary.stages_completed,
        total_stages
    );
    if summary.sync_rounds > 0 {
        println!("  {} {}", style("Sync rounds:").bold(), summary.sync_rounds);
    }
    println!(
        "  {} {}",
        style("Duration:").bold(),
        format_duration(summary.duration)
    );
    for exit in summary.fleet.failures() {
        let code = exit
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        println!(
            "  {} rank {} exited with {}{}",
            style("Worker:").yellow().bold(),
            exit.rank,
            code,
            exit.error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
    println!();
}

/// Print a header at the start of the run
pub fn print_header(run_id: &str, policy: &str, fleet_size: usize, stages: &[&str]) {
    println!();
    println!(
        "{} {}",
        style("pipeline-harness").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Run id:").bold(), run_id);
    println!("  {} {}", style("Policy:").bold(), policy);
    println!("  {} {}", style("Workers:").bold(), fleet_size);
    println!("  {} {}", style("Stages:").bold(), stages.join(" → "));
    println!();
}
