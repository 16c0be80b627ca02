//! CLI output formatting

use crate::{
    core::{ExecutionStatus, StageId},
    execution::ExecutionEvent,
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar over the stage list
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a run status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a run summary for the history listing
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };

    let mut line = format!(
        "{} {} - {} - {} ({}/{})",
        status_icon,
        style(short_id(&summary.run_id.to_string())).dim(),
        style(summary.started_at.format("%Y-%m-%d %H:%M")).dim(),
        format_status(summary.status),
        summary.finished_stages,
        summary.total_stages
    );
    if let Some(toolchain) = &summary.toolchain {
        line.push_str(&format!(" - {}", style(toolchain).cyan()));
    }
    if let Some(score) = summary.verification_score {
        line.push_str(&format!(" - evidence {}", style(format!("{}%", score)).bold()));
    }
    if let Some(stage) = &summary.failed_stage {
        line.push_str(&format!(" - at {}", style(stage).red()));
    }
    line
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            stages,
        } => format!(
            "{} Starting {} ({}, {} stages)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(&run_id.to_string())).dim(),
            stages
        ),
        ExecutionEvent::StageStarted { stage } => {
            format!("{} {}", SPINNER, style(stage).cyan())
        }
        ExecutionEvent::StageSkipped { stage, reason } => {
            format!("{} {} ({})", SKIP, style(stage).dim(), reason)
        }
        ExecutionEvent::StageWarning { stage, message } => {
            format!("{} {}: {}", WARN, style(stage).yellow(), message)
        }
        ExecutionEvent::StageCompleted {
            stage,
            summary,
            duration,
        } => format!(
            "{} {} {} {}",
            CHECK,
            style(stage).green(),
            summary,
            style(format_duration(*duration)).dim()
        ),
        ExecutionEvent::StageFailed { stage, error } => {
            let first = error.lines().next().unwrap_or_default();
            format!("{} {}: {}", CROSS, style(stage).red(), style(first).dim())
        }
        ExecutionEvent::RunCompleted { run_id, status } => format!(
            "{} Run {} {}",
            INFO,
            style(short_id(&run_id.to_string())).dim(),
            format_status(*status)
        ),
    }
}

/// Numbered stage list for `--dry-run`
pub fn format_plan(plan: &[StageId]) -> String {
    plan.iter()
        .enumerate()
        .map(|(i, stage)| {
            format!(
                "  {:>2}. {:<20} {}",
                i + 1,
                style(stage.as_str()).cyan(),
                style(stage.description()).dim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

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

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
