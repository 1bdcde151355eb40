//! CLI output formatting

use crate::execution::ExperimentEvent;
use crate::persistence::ExperimentRecord;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar counting finished experiments
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(bar) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(bar.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an experiment event for display
pub fn format_experiment_event(event: &ExperimentEvent) -> String {
    match event {
        ExperimentEvent::StepFailed(outcome) => format!(
            "{} #{} {} {}: {} ({})",
            CROSS,
            outcome.index,
            style(&outcome.subject).bold(),
            style(&outcome.action).cyan(),
            outcome.description,
            style(outcome.status).red()
        ),
        ExperimentEvent::StreamFailed { subject, error, .. } => format!(
            "{} {} aborted: {}",
            WARN,
            style(subject).bold(),
            style(error).red()
        ),
        ExperimentEvent::Completed { subject, .. } => {
            format!("{} {}", CHECK, style(subject).green())
        }
    }
}

/// Format an experiment record for display
pub fn format_experiment_record(record: &ExperimentRecord) -> String {
    let (icon, duration) = match (record.begin, record.end) {
        (Some(begin), Some(end)) => (
            CHECK,
            end.signed_duration_since(begin)
                .to_std()
                .map(format_duration)
                .unwrap_or_default(),
        ),
        (Some(_), None) => (SPINNER, "unfinished".to_string()),
        _ => (INFO, "never started".to_string()),
    };

    let begin = record
        .begin
        .map(|b| b.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} ({})",
        icon,
        style(&record.id.to_string()[..8]).dim(),
        style(&record.name).bold(),
        style(begin).dim(),
        style(duration).cyan()
    )
}

/// Format a duration as `1h 2m 3s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
