//! Test: a conflicting patch stops the run at that patch

use crate::helpers::*;
use std::sync::Arc;
use ultibuild::core::{ExecutionStatus, PipelineError, StageId};
use ultibuild::execution::RunOptions;

#[tokio::test]
async fn test_conflict_names_set_and_operation() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace).fail(
        "0002-strip-urls.patch",
        1,
        "error: patch failed: components/url_formatter.cc:42",
    ));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    let failure = result.unwrap_err();
    assert_eq!(failure.stage, StageId::PrivacyPatch);
    match &failure.error {
        PipelineError::PatchConflict {
            set,
            index,
            operation,
            reason,
        } => {
            assert_eq!(set, "ungoogled-chromium");
            assert_eq!(*index, 1);
            assert_eq!(operation, "core/0002-strip-urls.patch");
            assert!(reason.contains("patch failed"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // The first patch stays applied; `patch -p1` was only dry-run
    assert_eq!(runner.count("0001-disable-metrics.patch"), 1);
    assert_eq!(runner.count("--dry-run"), 1);
    assert!(runner
        .command_lines()
        .iter()
        .all(|line| !(line.starts_with("patch ") && line.contains("0002") && !line.contains("--dry-run"))));

    // Nothing after the conflict ran
    assert_eq!(runner.count("hide-sync"), 0);
    assert_stage(&ctx, StageId::OptimizationPatch, "pending");
    assert_stage(&ctx, StageId::BuildExecute, "pending");
    assert!(!runner.calls().iter().any(is_target_build));
    assert!(!workspace.path(".stamps/privacy-patch.done").exists());

    assert_eq!(ctx.state.status, ExecutionStatus::Failed);
    assert!(read_report(&workspace).contains("conflicted at operation 1"));
}

#[tokio::test]
async fn test_fallback_patch_tool_rescues_a_diff() {
    let workspace = Workspace::new();
    // git apply rejects the diff, patch -p1 accepts it
    let runner = Arc::new(happy_runner(&workspace).on(
        |cmd| cmd.program == "git" && cmd.command_line().contains("0002-strip-urls.patch"),
        |_| Ok(ultibuild::runner::CommandOutput::failed(1, "error: corrupt patch")),
    ));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    result.unwrap();
    assert_stage(&ctx, StageId::PrivacyPatch, "completed");
    assert_eq!(runner.count("patch -p1"), 2);
    assert!(ctx.patch_results[0]
        .applied
        .contains(&"core/0002-strip-urls.patch".to_string()));
}

#[tokio::test]
async fn test_missing_markers_are_warnings() {
    let workspace = Workspace::new();
    // The metrics diff "applies" without leaving its marker behind
    let runner = Arc::new(
        happy_runner(&workspace).respond("0001-disable-metrics.patch", ultibuild::runner::CommandOutput::ok("")),
    );

    let (ctx, result) = run_build(&workspace, runner, AMPLE_MEMORY_MB, RunOptions::default()).await;

    result.unwrap();
    assert_stage(&ctx, StageId::PrivacyPatch, "completed");
    assert_warned(
        &ctx,
        "marker \"ungoogled-chromium\" not found in chrome/browser/chrome_browser_main.cc",
    );
    assert_warned(&ctx, "marker \"ungoogled-chromium\" not found in chrome/browser/about_flags.cc");
    let privacy = format!("{:?}", ctx.state.get(StageId::PrivacyPatch).unwrap());
    assert!(privacy.contains("0/2 markers verified"));
    assert!(read_report(&workspace).contains("[privacy-patch] ungoogled-chromium: marker"));
}
