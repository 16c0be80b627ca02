//! Consolidated run report (`logs/report.txt`)

use crate::core::{LogLevel, PipelineContext, PipelineError, StageId, StageState};
use std::fmt::Write as _;
use std::path::PathBuf;

pub const FILE_NAME: &str = "report.txt";

/// Render everything the run has produced so far
pub fn render(ctx: &PipelineContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} build report", ctx.config.name);
    let _ = writeln!(out, "Run:    {}", ctx.run_id);
    let _ = writeln!(out, "Status: {}", ctx.state.status.as_str());
    let _ = writeln!(out, "Root:   {}", ctx.paths.root.display());
    if let Some(started) = ctx.state.started_at {
        let _ = writeln!(out, "Start:  {}", started.to_rfc3339());
    }

    let _ = writeln!(out, "\nStages");
    for record in ctx.state.stages.iter().filter(|r| r.id != StageId::Report) {
        let detail = match &record.state {
            StageState::Completed { summary, .. } => summary.clone(),
            StageState::Skipped { reason } => reason.clone(),
            StageState::Failed { error, .. } => error.lines().next().unwrap_or_default().to_string(),
            _ => String::new(),
        };
        let _ = writeln!(
            out,
            "  {:<20} {:<10} {}",
            record.id.as_str(),
            record.state.label(),
            detail
        );
    }

    let _ = writeln!(out, "\nToolchain");
    match ctx.active_toolchain() {
        Some(toolchain) => {
            let _ = writeln!(out, "  profile:  {}", toolchain.tag());
            let _ = writeln!(out, "  prefix:   {}", toolchain.profile.prefix.display());
            let features = toolchain.profile.features();
            let _ = writeln!(
                out,
                "  features: {}",
                if features.is_empty() {
                    "none".to_string()
                } else {
                    features.join(", ")
                }
            );
            if let Some(reason) = &toolchain.fallback_reason {
                let _ = writeln!(out, "  fallback: {}", reason.lines().next().unwrap_or_default());
            }
        }
        None => {
            let _ = writeln!(out, "  not bound");
        }
    }

    if !ctx.sync_results.is_empty() {
        let _ = writeln!(out, "\nResources");
        for result in &ctx.sync_results {
            let _ = writeln!(
                out,
                "  {:<24} {:<9} {}",
                result.name,
                result.action.as_str(),
                result.revision
            );
        }
    }

    if !ctx.patch_results.is_empty() {
        let _ = writeln!(out, "\nPatches");
        for result in &ctx.patch_results {
            let _ = writeln!(out, "  {:<24} {} operations", result.set, result.applied.len());
        }
    }

    if let Some(build) = &ctx.build_result {
        let _ = writeln!(out, "\nBuild");
        let _ = writeln!(out, "  targets:  {}", build.targets.join(", "));
        let _ = writeln!(out, "  duration: {}s", build.duration.as_secs());
        let _ = writeln!(out, "  jobs:     {}", build.jobs);
        let _ = writeln!(out, "  log:      {}", build.log_path.display());
    }

    let _ = writeln!(out);
    match &ctx.evidence {
        Some(report) => out.push_str(&report.render_text()),
        None => {
            let _ = writeln!(out, "Optimization evidence: not available");
        }
    }

    if let Some(package) = &ctx.package_path {
        let _ = writeln!(out, "\nPackage: {}", package.display());
    }

    let warnings: Vec<_> = ctx
        .run_log
        .iter()
        .filter(|e| e.level == LogLevel::Warn)
        .collect();
    if !warnings.is_empty() {
        let _ = writeln!(out, "\nWarnings");
        for entry in warnings {
            let stage = entry.stage.map(|s| s.as_str()).unwrap_or("run");
            let _ = writeln!(out, "  [{}] {}", stage, entry.message);
        }
    }

    out
}

/// Write the report into the logs directory
pub fn write(ctx: &PipelineContext) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(&ctx.paths.logs)
        .map_err(|e| PipelineError::io(format!("creating {}", ctx.paths.logs.display()), e))?;
    let path = ctx.paths.log(FILE_NAME);
    std::fs::write(&path, render(ctx))
        .map_err(|e| PipelineError::io(format!("writing {}", path.display()), e))?;
    Ok(path)
}
