//! Test: a second run over the same root reuses finished work

use crate::helpers::*;
use std::sync::Arc;
use ultibuild::core::{ExecutionStatus, StageId};
use ultibuild::execution::RunOptions;
use ultibuild::sync::SyncAction;

#[tokio::test]
async fn test_rerun_skips_stamped_stages() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (first, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;
    result.unwrap();
    let applied_first = runner.count("git apply");

    let (second, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;
    result.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.state.status, ExecutionStatus::Completed);

    // Toolchain restored from its stamp, patches not re-applied
    assert_stage(&second, StageId::ToolchainSetup, "skipped");
    assert_stage(&second, StageId::PrivacyPatch, "skipped");
    assert_stage(&second, StageId::OptimizationPatch, "skipped");
    assert_eq!(runner.count("cmake -G Ninja"), 1);
    assert_eq!(runner.count("git apply"), applied_first);
    assert_eq!(second.active_toolchain().unwrap().tag(), "custom-built");
    assert_eq!(second.patch_results, first.patch_results);

    // Checkouts exist, so nothing is cloned twice
    assert_eq!(runner.count("git clone"), 4);

    // Unpinned patch repositories are refreshed; the pinned source is not re-checked-out
    assert_stage(&second, StageId::ResourceSync, "completed");
    assert!(second
        .sync_results
        .iter()
        .all(|r| r.action == SyncAction::Updated));
    assert_eq!(runner.count("checkout"), 0);

    // The build itself always runs and a fresh bundle is produced
    assert_stage(&second, StageId::BuildExecute, "completed");
    assert_ne!(first.package_path, second.package_path);
}

#[tokio::test]
async fn test_fully_pinned_resources_skip_sync() {
    let mut workspace = Workspace::new();
    // Pin every resource to the same revision file
    let pin = std::path::PathBuf::from("pins/revision.txt");
    for resource in &mut workspace.config.resources {
        resource.pin_file = Some(pin.clone());
    }
    std::fs::create_dir_all(workspace.path("pins")).unwrap();
    std::fs::write(workspace.path("pins/revision.txt"), format!("{}\n", REVISION)).unwrap();
    workspace.config.package.version = Some("120.0.6099.224".to_string());

    let runner = Arc::new(happy_runner(&workspace));
    let (_, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;
    result.unwrap();

    let (second, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;
    result.unwrap();

    assert_stage(&second, StageId::ResourceSync, "skipped");
    assert!(second
        .sync_results
        .iter()
        .all(|r| r.action == SyncAction::Restored && r.revision == REVISION));
    assert_eq!(runner.count("fetch --tags"), 0);
}
