//! The eleven pipeline stages

use crate::build::{BuildConfigGenerator, BuildExecutor};
use crate::core::{
    prepend_path, PatchMarker, Precondition, PipelineContext, PipelineError, Stage, StageId,
    StageOutcome, TemplateVars,
};
use crate::execution::report;
use crate::package::{Artifact, ArtifactPackager};
use crate::patch::{check_markers, ApplyResult, PatchApplier, PatchSet};
use crate::runner::CommandRunner;
use crate::sync::{ResourceSpec, ResourceSync, SyncAction, SyncResult};
use crate::toolchain::{MemoryProbe, ToolchainBuilder};
use crate::verify::OptimizationVerifier;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// The standard stage list, in execution order
pub fn standard_stages(
    runner: Arc<dyn CommandRunner>,
    memory: Arc<dyn MemoryProbe>,
    clean: bool,
) -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(DependencyCheck::new(runner.clone())),
        Box::new(EnvironmentSetup::new(clean)),
        Box::new(SyncResources::new(runner.clone())),
        Box::new(ToolchainSetup::new(runner.clone(), memory)),
        Box::new(ApplyPatches::new(PatchPhase::Privacy, runner.clone())),
        Box::new(ApplyPatches::new(PatchPhase::Optimization, runner.clone())),
        Box::new(GenerateConfig::new(runner.clone())),
        Box::new(ExecuteBuild::new(runner.clone())),
        Box::new(VerifyBinary::new(runner.clone())),
        Box::new(PackageArtifacts::new(runner)),
        Box::new(WriteReport),
    ]
}

/// Tool search path: configured directories ahead of the inherited PATH
fn search_path(ctx: &PipelineContext) -> Option<String> {
    let front: Vec<PathBuf> = ctx
        .config
        .search_path
        .iter()
        .map(|p| ctx.paths.under_root(p))
        .collect();
    let inherited = ctx
        .env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok());
    prepend_path(&front, inherited.as_deref())
}

fn find_tool(tool: &str, path: Option<&str>) -> Option<PathBuf> {
    if tool.contains(std::path::MAIN_SEPARATOR) {
        let candidate = PathBuf::from(tool);
        return is_executable_file(&candidate).then_some(candidate);
    }
    std::env::split_paths(path?)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable_file(candidate))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Output directory of the target build
fn out_dir(ctx: &PipelineContext) -> PathBuf {
    ctx.config_handle
        .as_ref()
        .map(|h| h.out_dir.clone())
        .unwrap_or_else(|| ctx.paths.source.join(&ctx.config.build.out_dir))
}

fn write_stamp(path: &Path, contents: &str) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PipelineError::io(format!("creating {}", parent.display()), e))?;
    }
    std::fs::write(path, contents)
        .map_err(|e| PipelineError::io(format!("writing {}", path.display()), e))
}

// ---------------------------------------------------------------------------

/// Required host tools are on PATH
pub struct DependencyCheck {
    runner: Arc<dyn CommandRunner>,
}

impl DependencyCheck {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn missing(ctx: &PipelineContext) -> Vec<String> {
        let path = search_path(ctx);
        ctx.config
            .dependencies
            .required_tools
            .iter()
            .filter(|tool| find_tool(tool, path.as_deref()).is_none())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Stage for DependencyCheck {
    fn id(&self) -> StageId {
        StageId::DependencyCheck
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let total = ctx.config.dependencies.required_tools.len();
        let missing = Self::missing(ctx);
        if missing.is_empty() {
            return Ok(StageOutcome::new(format!("{} tools found", total)));
        }

        let Some(script) = ctx.config.dependencies.install_script.clone() else {
            return Err(PipelineError::DependencyMissing { tools: missing });
        };

        ctx.note(format!("installing missing tools: {}", missing.join(", ")));
        let cmd = script
            .render(&TemplateVars::new().set_list("tools", missing.clone()))
            .envs(&ctx.env)
            .log_to(ctx.paths.log("dependencies.log"));
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => {}
            Ok(output) => ctx.warn(format!("install script failed: {}", output.diagnostic())),
            Err(e) => ctx.warn(format!("install script failed: {}", e)),
        }

        let still_missing = Self::missing(ctx);
        if !still_missing.is_empty() {
            return Err(PipelineError::DependencyMissing {
                tools: still_missing,
            });
        }
        Ok(StageOutcome::new(format!(
            "{} tools found after installing {}",
            total,
            missing.join(", ")
        )))
    }
}

// ---------------------------------------------------------------------------

/// Directory layout and base environment
pub struct EnvironmentSetup {
    clean: bool,
}

impl EnvironmentSetup {
    pub fn new(clean: bool) -> Self {
        Self { clean }
    }
}

#[async_trait]
impl Stage for EnvironmentSetup {
    fn id(&self) -> StageId {
        StageId::EnvironmentSetup
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let root = ctx.paths.root.clone();
        if self.clean && root.exists() {
            std::fs::remove_dir_all(&root)
                .map_err(|e| PipelineError::io(format!("cleaning {}", root.display()), e))?;
            ctx.note(format!("removed {}", root.display()));
        }

        for dir in [
            &ctx.paths.root,
            &ctx.paths.logs,
            &ctx.paths.artifacts,
            &ctx.paths.stamps,
            &ctx.paths.scratch,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| PipelineError::io(format!("creating {}", dir.display()), e))?;
        }

        if let Some(path) = search_path(ctx) {
            ctx.env.insert("PATH".to_string(), path);
        }

        let mut log = String::new();
        let _ = writeln!(log, "run_id={}", ctx.run_id);
        let _ = writeln!(log, "root={}", ctx.paths.root.display());
        let _ = writeln!(log, "source={}", ctx.paths.source.display());
        for (key, value) in &ctx.env {
            let _ = writeln!(log, "{}={}", key, value);
        }
        let log_path = ctx.paths.log("environment.log");
        std::fs::write(&log_path, log)
            .map_err(|e| PipelineError::io(format!("writing {}", log_path.display()), e))?;

        Ok(StageOutcome::new(format!(
            "layout ready under {}",
            ctx.paths.root.display()
        )))
    }
}

// ---------------------------------------------------------------------------

/// Every configured resource at its pinned revision
pub struct SyncResources {
    runner: Arc<dyn CommandRunner>,
}

impl SyncResources {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn specs(ctx: &PipelineContext) -> Vec<ResourceSpec> {
        ctx.config
            .resources
            .iter()
            .map(|r| ResourceSpec::from_config(r, &ctx.paths))
            .collect()
    }

    fn sync(&self, ctx: &PipelineContext) -> ResourceSync {
        ResourceSync::new(self.runner.clone(), ctx.config.fetch_timeout()).with_env(ctx.env.clone())
    }
}

#[async_trait]
impl Stage for SyncResources {
    fn id(&self) -> StageId {
        StageId::ResourceSync
    }

    /// Satisfied only when every resource is pinned and already at its pin
    async fn precondition(&self, ctx: &PipelineContext) -> Precondition {
        let sync = self.sync(ctx);
        for spec in Self::specs(ctx) {
            if !sync.is_synced(&spec).await {
                return Precondition::Unsatisfied;
            }
        }
        Precondition::Satisfied("all resources at their pinned revisions".to_string())
    }

    async fn restore(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let sync = self.sync(ctx);
        for spec in Self::specs(ctx) {
            let revision = sync
                .revision(&spec.path)
                .await
                .unwrap_or_else(|| "unknown".to_string());
            ctx.sync_results.push(SyncResult {
                name: spec.name.clone(),
                path: spec.path.clone(),
                action: SyncAction::Restored,
                pinned: None,
                revision,
                warnings: Vec::new(),
            });
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let sync = self.sync(ctx);
        let specs = Self::specs(ctx);
        for spec in &specs {
            info!("Syncing {}", spec.name);
            let result = sync.sync(spec).await?;
            for warning in &result.warnings {
                ctx.warn(format!("{}: {}", spec.name, warning));
            }
            ctx.note(format!(
                "{} {} at {}",
                spec.name,
                result.action.as_str(),
                result.revision
            ));
            ctx.sync_results.push(result);
        }
        Ok(StageOutcome::new(format!("{} resources synced", specs.len())))
    }
}

// ---------------------------------------------------------------------------

/// Custom toolchain, or the system one when the custom build fails
pub struct ToolchainSetup {
    builder: ToolchainBuilder,
}

impl ToolchainSetup {
    pub fn new(runner: Arc<dyn CommandRunner>, memory: Arc<dyn MemoryProbe>) -> Self {
        Self {
            builder: ToolchainBuilder::new(runner, memory),
        }
    }
}

#[async_trait]
impl Stage for ToolchainSetup {
    fn id(&self) -> StageId {
        StageId::ToolchainSetup
    }

    async fn precondition(&self, ctx: &PipelineContext) -> Precondition {
        match ToolchainBuilder::load_stamp(ctx) {
            Some(active) => Precondition::Satisfied(format!(
                "custom toolchain already installed at {}",
                active.profile.prefix.display()
            )),
            None => Precondition::Unsatisfied,
        }
    }

    async fn restore(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let active = ToolchainBuilder::load_stamp(ctx).ok_or_else(|| {
            PipelineError::Config(format!(
                "toolchain stamp {} is no longer valid",
                ToolchainBuilder::stamp_path(ctx).display()
            ))
        })?;
        ctx.bind_toolchain(active)
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let requested = ToolchainBuilder::requested_profile(ctx);
        let active = self.builder.build(&requested, ctx).await?;
        let summary = if active.is_fallback() {
            format!("{} (baseline only)", active.tag())
        } else {
            format!("{} ({})", active.tag(), active.profile.features().join(", "))
        };
        ctx.bind_toolchain(active)?;
        Ok(StageOutcome::new(summary))
    }
}

// ---------------------------------------------------------------------------

/// Which patch collection a patch stage applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchPhase {
    Privacy,
    Optimization,
}

impl PatchPhase {
    fn stage(&self) -> StageId {
        match self {
            PatchPhase::Privacy => StageId::PrivacyPatch,
            PatchPhase::Optimization => StageId::OptimizationPatch,
        }
    }

    fn resource<'a>(&self, ctx: &'a PipelineContext) -> &'a str {
        match self {
            PatchPhase::Privacy => &ctx.config.patches.privacy.resource,
            PatchPhase::Optimization => &ctx.config.patches.optimization.resource,
        }
    }

    fn markers<'a>(&self, ctx: &'a PipelineContext) -> &'a [PatchMarker] {
        match self {
            PatchPhase::Privacy => &ctx.config.patches.privacy.markers,
            PatchPhase::Optimization => &ctx.config.patches.optimization.markers,
        }
    }

    fn stamp(&self, ctx: &PipelineContext) -> PathBuf {
        ctx.paths.stamp(&format!("{}.done", self.stage().as_str()))
    }
}

/// Applies one patch collection to the source tree
pub struct ApplyPatches {
    phase: PatchPhase,
    runner: Arc<dyn CommandRunner>,
}

impl ApplyPatches {
    pub fn new(phase: PatchPhase, runner: Arc<dyn CommandRunner>) -> Self {
        Self { phase, runner }
    }

    fn load(&self, ctx: &mut PipelineContext) -> Result<PatchSet, PipelineError> {
        let resource_name = self.phase.resource(ctx).to_string();
        let resource = ctx.config.resource(&resource_name).ok_or_else(|| {
            PipelineError::Config(format!("unknown patch resource `{}`", resource_name))
        })?;
        let source = ctx.paths.resource(resource);

        let mut warnings = Vec::new();
        let set = match self.phase {
            PatchPhase::Privacy => PatchSet::load_privacy(
                &resource_name,
                &ctx.config.patches.privacy,
                &source,
                &mut warnings,
            ),
            PatchPhase::Optimization => PatchSet::load_optimization(
                &resource_name,
                &ctx.config.patches.optimization,
                &source,
                &mut warnings,
            ),
        };
        for warning in warnings {
            ctx.warn(warning);
        }
        set
    }
}

#[async_trait]
impl Stage for ApplyPatches {
    fn id(&self) -> StageId {
        self.phase.stage()
    }

    async fn precondition(&self, ctx: &PipelineContext) -> Precondition {
        if self.phase.stamp(ctx).is_file() {
            Precondition::Satisfied("already applied to this source tree".to_string())
        } else {
            Precondition::Unsatisfied
        }
    }

    async fn restore(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let stamp = self.phase.stamp(ctx);
        let content = std::fs::read_to_string(&stamp)
            .map_err(|e| PipelineError::io(format!("reading {}", stamp.display()), e))?;
        match serde_json::from_str::<ApplyResult>(&content) {
            Ok(result) => ctx.patch_results.push(result),
            Err(e) => debug!("stamp {} has no result record: {}", stamp.display(), e),
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let set = self.load(ctx)?;
        let applier = PatchApplier::new(self.runner.clone())
            .with_env(ctx.env.clone())
            .log_to(ctx.paths.log(&format!("{}.log", self.phase.stage().as_str())));
        let result = applier.apply(&set, &ctx.paths.source).await?;

        let record = serde_json::to_string_pretty(&result)
            .map_err(|e| PipelineError::Config(format!("serializing patch result: {}", e)))?;
        write_stamp(&self.phase.stamp(ctx), &record)?;

        let mut summary = format!("{} operations from {}", result.applied.len(), result.set);
        let check = check_markers(self.phase.markers(ctx), &ctx.paths.source);
        for marker in &check.missing {
            ctx.warn(format!(
                "{}: marker {:?} not found in {}",
                result.set,
                marker.contains,
                marker.file.display()
            ));
        }
        if check.total() > 0 {
            summary.push_str(&format!(", {}/{} markers verified", check.verified, check.total()));
        }
        ctx.patch_results.push(result);
        Ok(StageOutcome::new(summary))
    }
}

// ---------------------------------------------------------------------------

/// Writes and generates the target build configuration
pub struct GenerateConfig {
    generator: BuildConfigGenerator,
}

impl GenerateConfig {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            generator: BuildConfigGenerator::new(runner),
        }
    }
}

#[async_trait]
impl Stage for GenerateConfig {
    fn id(&self) -> StageId {
        StageId::ConfigGenerate
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let handle = self.generator.generate(ctx).await?;
        let summary = format!("configured {}", handle.out_dir.display());
        ctx.config_handle = Some(handle);
        Ok(StageOutcome::new(summary))
    }

    /// A rejected configuration must not be mistaken for a usable one
    async fn cleanup(&self, ctx: &PipelineContext) {
        let args_file = out_dir(ctx).join("args.gn");
        if args_file.exists() {
            let _ = std::fs::remove_file(&args_file);
        }
    }
}

// ---------------------------------------------------------------------------

pub struct ExecuteBuild {
    executor: BuildExecutor,
}

impl ExecuteBuild {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            executor: BuildExecutor::new(runner),
        }
    }
}

#[async_trait]
impl Stage for ExecuteBuild {
    fn id(&self) -> StageId {
        StageId::BuildExecute
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let handle = ctx.config_handle.clone().ok_or_else(|| {
            PipelineError::Config("build configuration was not generated".to_string())
        })?;
        let targets = ctx.config.build.targets.clone();
        let result = self.executor.execute(&handle, &targets, ctx).await?;
        let summary = format!(
            "built {} in {}s with {} jobs",
            result.targets.join(", "),
            result.duration.as_secs(),
            result.jobs
        );
        ctx.build_result = Some(result);
        Ok(StageOutcome::new(summary))
    }
}

// ---------------------------------------------------------------------------

pub struct VerifyBinary {
    runner: Arc<dyn CommandRunner>,
}

impl VerifyBinary {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Stage for VerifyBinary {
    fn id(&self) -> StageId {
        StageId::Verify
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let binary = out_dir(ctx).join(&ctx.config.verify.binary);
        let verifier = OptimizationVerifier::from_config(self.runner.clone(), ctx.config.verify.clone())?;
        let report = verifier.verify(&binary).await?;

        for note in &report.inconclusive {
            ctx.warn(format!("verification probe unavailable: {}", note));
        }

        let json_path = ctx.paths.log("verification.json");
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| PipelineError::Config(format!("serializing evidence: {}", e)))?;
        std::fs::write(&json_path, json)
            .map_err(|e| PipelineError::io(format!("writing {}", json_path.display()), e))?;

        let summary = format!("{}% ({})", report.score, report.rating.as_str());
        ctx.evidence = Some(report);
        Ok(StageOutcome::new(summary))
    }
}

// ---------------------------------------------------------------------------

pub struct PackageArtifacts {
    packager: ArtifactPackager,
}

impl PackageArtifacts {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            packager: ArtifactPackager::new(runner),
        }
    }
}

#[async_trait]
impl Stage for PackageArtifacts {
    fn id(&self) -> StageId {
        StageId::Package
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let out = out_dir(ctx);
        let package = &ctx.config.package;
        let mut artifacts = vec![Artifact::required(out.join(&package.primary_artifact))];
        artifacts.extend(
            package
                .optional_artifacts
                .iter()
                .map(|a| Artifact::optional(out.join(a))),
        );
        let resource_dirs: Vec<PathBuf> = package.resource_dirs.iter().map(|d| out.join(d)).collect();

        let result = self.packager.package(&artifacts, &resource_dirs, ctx).await?;
        let output = result.output().to_path_buf();
        ctx.package_path = Some(output.clone());
        Ok(StageOutcome::new(format!(
            "{} items into {}",
            result.copied.len(),
            output.display()
        )))
    }

    /// Bundles without a provenance manifest never finished
    async fn cleanup(&self, ctx: &PipelineContext) {
        let prefix = format!("{}-", ctx.config.package.bundle_prefix);
        let Ok(entries) = std::fs::read_dir(&ctx.paths.artifacts) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir()
                && name.starts_with(&prefix)
                && !path.join(crate::package::provenance::FILE_NAME).exists()
            {
                debug!("removing incomplete bundle {}", path.display());
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }
}

// ---------------------------------------------------------------------------

pub struct WriteReport;

#[async_trait]
impl Stage for WriteReport {
    fn id(&self) -> StageId {
        StageId::Report
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError> {
        let path = report::write(ctx)?;
        Ok(StageOutcome::new(format!("report at {}", path.display())))
    }
}
