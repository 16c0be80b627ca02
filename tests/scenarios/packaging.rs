//! Test: packaging failures and degraded verification

use crate::helpers::*;
use std::sync::Arc;
use ultibuild::core::{ExecutionStatus, PipelineError, StageId};
use ultibuild::execution::RunOptions;
use ultibuild::runner::CommandOutput;

#[tokio::test]
async fn test_missing_primary_artifact_fails_packaging() {
    let workspace = Workspace::new();
    // The build "succeeds" without producing anything
    let runner = Arc::new(happy_runner(&workspace).on(is_target_build, |_| Ok(CommandOutput::ok(""))));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    let failure = result.unwrap_err();
    assert_eq!(failure.stage, StageId::Package);
    assert!(matches!(failure.error, PipelineError::PackagingFailure(_)));

    // Verification could not look at the binary but did not fail the run
    let verify = ctx.state.get(StageId::Verify).unwrap();
    assert_eq!(verify.label(), "completed");
    assert!(format!("{:?}", verify).contains("degraded"));
    assert_warned(&ctx, "verification inconclusive");
    assert!(ctx.evidence.is_none());
    assert_eq!(runner.count("readelf"), 0);

    // No half-made bundle is left behind
    let bundles = std::fs::read_dir(workspace.path("artifacts")).unwrap().count();
    assert_eq!(bundles, 0);

    assert_eq!(ctx.state.status, ExecutionStatus::Failed);
    assert!(read_report(&workspace).contains("Optimization evidence: not available"));
}

#[tokio::test]
async fn test_archive_failure_keeps_bundle_directory() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace).fail("tar -cJf", 2, "tar: xz: Cannot exec"));

    let (ctx, result) = run_build(&workspace, runner, AMPLE_MEMORY_MB, RunOptions::default()).await;

    result.unwrap();
    let bundle = ctx.package_path.as_ref().unwrap();
    assert!(bundle.is_dir());
    assert!(bundle.join("provenance.txt").exists());
    assert!(bundle.join("chrome").exists());
    assert_warned(&ctx, "archiving failed");
}

#[tokio::test]
async fn test_missing_optional_artifacts_are_warnings() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner, AMPLE_MEMORY_MB, RunOptions::default()).await;

    result.unwrap();
    assert_warned(&ctx, "optional artifact chrome_sandbox not found");
    assert_warned(&ctx, "resource directory resources not found");
    assert_stage(&ctx, StageId::Package, "completed");
    assert!(read_report(&workspace).contains("[package] optional artifact libEGL.so not found"));
}
