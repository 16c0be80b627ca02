//! Test: too little memory stops the run before the toolchain is touched

use crate::helpers::*;
use std::sync::Arc;
use ultibuild::core::{ExecutionStatus, PipelineError, StageId};
use ultibuild::execution::RunOptions;

#[tokio::test]
async fn test_insufficient_memory_is_a_hard_stop() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner.clone(), 2 * 1024, RunOptions::default()).await;

    let failure = result.unwrap_err();
    assert_eq!(failure.stage, StageId::ToolchainSetup);
    assert!(matches!(
        failure.error,
        PipelineError::ResourceInsufficient {
            required_mb: 4096,
            available_mb: 2048
        }
    ));
    assert!(failure.to_string().contains("logs preserved in"));

    // No custom build and no fallback were attempted
    assert_eq!(runner.count("cmake"), 0);
    assert_eq!(runner.count("apt-get"), 0);
    assert_eq!(runner.count("llvm-project"), 0);

    assert_eq!(ctx.state.status, ExecutionStatus::Failed);
    assert_eq!(ctx.state.failed_stage, Some(StageId::ToolchainSetup));
    assert_stage(&ctx, StageId::ResourceSync, "completed");
    assert_stage(&ctx, StageId::ToolchainSetup, "failed");
    for stage in [
        StageId::PrivacyPatch,
        StageId::OptimizationPatch,
        StageId::ConfigGenerate,
        StageId::BuildExecute,
        StageId::Verify,
        StageId::Package,
        StageId::Report,
    ] {
        assert_stage(&ctx, stage, "pending");
    }

    let report = read_report(&workspace);
    assert!(report.contains("Status: failed"));
    assert!(report.contains("insufficient memory"));
    assert!(!ctx.paths.scratch.exists());
}

#[tokio::test]
async fn test_memory_floor_is_configurable() {
    let mut workspace = Workspace::new();
    workspace.config.toolchain.min_memory_gb = 1;
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner, 2 * 1024, RunOptions::default()).await;

    result.unwrap();
    assert_eq!(ctx.active_toolchain().unwrap().tag(), "custom-built");
}
