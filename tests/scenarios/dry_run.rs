//! Test: --dry-run and --skip-deps

use crate::helpers::*;
use std::sync::Arc;
use ultibuild::core::{PipelineError, StageId};
use ultibuild::execution::RunOptions;

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(
        &workspace,
        runner.clone(),
        AMPLE_MEMORY_MB,
        RunOptions {
            dry_run: true,
            ..RunOptions::default()
        },
    )
    .await;

    result.unwrap();
    assert!(runner.calls().is_empty());
    for stage in StageId::ALL {
        assert_stage(&ctx, stage, "skipped");
    }
    assert!(!workspace.path("logs").exists());
    assert!(!workspace.path(".stamps").exists());
}

#[tokio::test]
async fn test_missing_tools_fail_unless_skipped() {
    let mut workspace = Workspace::new();
    workspace.config.dependencies.required_tools = vec!["ultibuild-no-such-tool".to_string()];
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    let failure = result.unwrap_err();
    assert_eq!(failure.stage, StageId::DependencyCheck);
    match failure.error {
        PipelineError::DependencyMissing { tools } => assert_eq!(tools, vec!["ultibuild-no-such-tool"]),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(runner.calls().is_empty());
    assert_stage(&ctx, StageId::EnvironmentSetup, "pending");

    let (ctx, result) = run_build(
        &workspace,
        runner,
        AMPLE_MEMORY_MB,
        RunOptions {
            skip_deps: true,
            ..RunOptions::default()
        },
    )
    .await;

    result.unwrap();
    assert_stage(&ctx, StageId::DependencyCheck, "skipped");
}
