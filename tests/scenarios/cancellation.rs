//! Test: dropping a run mid-build removes scratch and keeps logs

use crate::helpers::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use ultibuild::core::StageId;
use ultibuild::execution::{PipelineOrchestrator, RunOptions};
use ultibuild::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError, ScriptedRunner};
use ultibuild::toolchain::FixedMemory;

/// Scripted runner whose target build never finishes
struct HangingBuild {
    inner: ScriptedRunner,
}

#[async_trait]
impl CommandRunner for HangingBuild {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if is_target_build(spec) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.run(spec).await
    }
}

#[tokio::test]
async fn test_cancelled_run_cleans_scratch_only() {
    let workspace = Workspace::new();
    let runner = Arc::new(HangingBuild {
        inner: happy_runner(&workspace),
    });
    let orchestrator = PipelineOrchestrator::standard(
        runner,
        Arc::new(FixedMemory(AMPLE_MEMORY_MB)),
        RunOptions::default(),
    );
    let mut ctx = workspace.context();

    let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(&mut ctx)).await;
    assert!(outcome.is_err(), "run should still be building");

    ctx.state.cancel();
    assert_stage(&ctx, StageId::BuildExecute, "running");
    assert_stage(&ctx, StageId::ConfigGenerate, "completed");

    // The toolchain probe wrote into scratch; the guard removed it on drop
    assert!(!ctx.paths.scratch.exists());
    assert!(workspace.path("logs/environment.log").exists());
    assert!(workspace.path(".stamps/privacy-patch.done").exists());
}
