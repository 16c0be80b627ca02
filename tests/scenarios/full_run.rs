//! Test: a complete run from empty root to archived bundle

use crate::helpers::*;
use std::fs;
use std::sync::Arc;
use ultibuild::core::{ExecutionStatus, StageId};
use ultibuild::execution::RunOptions;
use ultibuild::verify::Rating;

#[tokio::test]
async fn test_full_run_completes_every_stage() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;

    result.unwrap();
    assert_eq!(ctx.state.status, ExecutionStatus::Completed);
    for stage in StageId::ALL {
        assert_stage(&ctx, stage, "completed");
    }

    // Custom toolchain built once and bound
    let toolchain = ctx.active_toolchain().unwrap();
    assert_eq!(toolchain.tag(), "custom-built");
    assert_eq!(runner.count("cmake -G Ninja"), 1);
    assert!(workspace.path(".stamps/toolchain.json").exists());

    // Target build requested every target in a single invocation
    let builds: Vec<_> = runner.calls().into_iter().filter(is_target_build).collect();
    assert_eq!(builds.len(), 1);
    assert!(builds[0].args.ends_with(&["chrome".to_string(), "chromedriver".to_string()]));
    assert_eq!(builds[0].env.get("CC").map(String::as_str), toolchain.profile.tool("CC").and_then(|p| p.to_str()));
}

#[tokio::test]
async fn test_patches_rewrite_and_prune_source_tree() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner.clone(), AMPLE_MEMORY_MB, RunOptions::default()).await;
    result.unwrap();

    let privacy = &ctx.patch_results[0];
    assert_eq!(privacy.set, "ungoogled-chromium");
    assert_eq!(
        privacy.applied,
        vec![
            "core/0001-disable-metrics.patch",
            "core/0002-strip-urls.patch",
            "extra/0001-hide-sync.patch",
            "inox-patchset/0001-no-hotword.patch",
            "domain-substitution",
            "pruning",
        ]
    );

    let optimization = &ctx.patch_results[1];
    assert_eq!(
        optimization.applied,
        vec![
            "V8/v8-inline-budget.patch",
            "Windows/win-avx512.patch",
            "Linux/lto-jobs.patch",
        ]
    );

    // Every configured marker was left behind by its diff
    assert!(!ctx.warnings().any(|w| w.message.contains("marker")));
    let privacy_stage = format!("{:?}", ctx.state.get(StageId::PrivacyPatch).unwrap());
    assert!(privacy_stage.contains("2/2 markers verified"));
    let optimization_stage = format!("{:?}", ctx.state.get(StageId::OptimizationPatch).unwrap());
    assert!(optimization_stage.contains("2/2 markers verified"));

    let source = workspace.path("chromium/src");
    let rewritten = fs::read_to_string(source.join("base/url_constants.cc")).unwrap();
    assert!(rewritten.contains("9oo91e.qjz9zk"));
    assert!(!source.join("third_party/prebuilt/blob.bin").exists());

    let args = fs::read_to_string(source.join("out/Ultimate/args.gn")).unwrap();
    let manifest = args.find("use_thin_lto").unwrap();
    let privacy_flags = args.find("enable_reporting").unwrap();
    let toolchain_section = args.find("clang_base_path").unwrap();
    assert!(manifest < privacy_flags && privacy_flags < toolchain_section);
}

#[tokio::test]
async fn test_evidence_provenance_and_report() {
    let workspace = Workspace::new();
    let runner = Arc::new(happy_runner(&workspace));

    let (ctx, result) = run_build(&workspace, runner, AMPLE_MEMORY_MB, RunOptions::default()).await;
    result.unwrap();

    let evidence = ctx.evidence.as_ref().unwrap();
    assert!(evidence.score > 0);
    assert_ne!(evidence.rating, Rating::Excellent, "no BOLT markers were scripted");
    assert!(evidence.inconclusive.is_empty());
    assert!(workspace.path("logs/verification.json").exists());

    let package = ctx.package_path.as_ref().unwrap();
    assert!(package.to_string_lossy().ends_with(".tar.xz"));
    let bundle_name = package
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_end_matches(".tar.xz")
        .to_string();
    assert!(bundle_name.starts_with(&format!("ultimate-chromium-{}-", CHROMIUM_VERSION)));

    let bundle = workspace.path("artifacts").join(&bundle_name);
    assert!(bundle.join("chrome").exists());
    assert!(bundle.join("chromedriver").exists());
    assert!(bundle.join("locales/en-US.pak").exists());

    let provenance = fs::read_to_string(bundle.join("provenance.txt")).unwrap();
    assert!(provenance.contains("toolchain_profile=custom-built"));
    assert!(provenance.contains(&format!("revision.chromium={}", REVISION)));
    assert!(provenance.contains(&format!("verification_score={}", evidence.score)));
    assert!(!provenance.contains("toolchain_features=none"));

    let report = read_report(&workspace);
    assert!(report.contains("Status: running") || report.contains("Status: completed"));
    assert!(report.contains("profile:  custom-built"));
    assert!(report.contains("Link-time optimization"));

    // Per-run scratch is gone, logs stay
    assert!(!ctx.paths.scratch.exists());
    assert!(workspace.path("logs/environment.log").exists());
}
