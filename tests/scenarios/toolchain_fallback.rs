//! Test: custom toolchain failures fall back to the system toolchain

use crate::helpers::*;
use std::fs;
use std::sync::Arc;
use ultibuild::core::{ExecutionStatus, PipelineError, StageId};
use ultibuild::execution::RunOptions;
use ultibuild::runner::CommandOutput;

fn failing_toolchain_install(workspace: &Workspace) -> ultibuild::runner::ScriptedRunner {
    happy_runner(workspace).on(
        |cmd| cmd.program == "ninja" && cmd.args.last().map(String::as_str) == Some("install"),
        |_| Ok(CommandOutput::failed(1, "ninja: build stopped: subcommand failed.")),
    )
}

#[tokio::test]
async fn test_failed_custom_build_still_produces_a_package() {
    let workspace = Workspace::new();
    let runner = Arc::new(failing_toolchain_install(&workspace));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    result.unwrap();
    assert_eq!(ctx.state.status, ExecutionStatus::Completed);

    let toolchain = ctx.active_toolchain().unwrap();
    assert_eq!(toolchain.tag(), "system-fallback");
    assert!(toolchain.profile.features().is_empty());
    assert!(toolchain
        .fallback_reason
        .as_deref()
        .unwrap()
        .contains("build stopped"));
    assert_warned(&ctx, "falling back to system toolchain");
    assert_eq!(runner.count("apt-get install"), 1);

    // A fallback is never recorded, so the next run tries the custom build again
    assert!(!workspace.path(".stamps/toolchain.json").exists());

    let args = fs::read_to_string(workspace.path("chromium/src/out/Ultimate/args.gn")).unwrap();
    assert!(args.contains("clang_base_path = \"/usr\""));
    assert!(args.contains("chrome_pgo_phase = 0"));

    let bundle = ctx.package_path.as_ref().unwrap().with_extension("").with_extension("");
    let provenance = fs::read_to_string(bundle.join("provenance.txt")).unwrap();
    assert!(provenance.contains("toolchain_profile=system-fallback"));
    assert!(provenance.contains("toolchain_features=none"));
    assert!(provenance.contains("target_isa=baseline"));
    assert!(provenance.contains("toolchain_fallback_reason="));

    let report = read_report(&workspace);
    assert!(report.contains("profile:  system-fallback"));
    assert!(report.contains("fallback: "));
}

#[tokio::test]
async fn test_failed_fallback_aborts_run() {
    let workspace = Workspace::new();
    let runner = Arc::new(
        failing_toolchain_install(&workspace).fail("apt-get install", 100, "E: Unable to locate package clang"),
    );

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    let failure = result.unwrap_err();
    assert_eq!(failure.stage, StageId::ToolchainSetup);
    match &failure.error {
        PipelineError::ToolchainUnavailable { custom, fallback } => {
            assert!(custom.contains("build stopped"));
            assert!(fallback.contains("Unable to locate package"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(ctx.state.status, ExecutionStatus::Failed);
    assert!(ctx.active_toolchain().is_none());
    assert_stage(&ctx, StageId::PrivacyPatch, "pending");
    assert_eq!(runner.count("git apply"), 0);
    assert!(workspace.path("logs/report.txt").exists());
}
