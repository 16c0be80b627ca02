//! Custom toolchain build with system fallback

use crate::core::{CommandTemplate, PipelineContext, PipelineError, TemplateVars};
use crate::runner::{CommandRunner, CommandSpec};
use crate::sync::{ResourceSpec, ResourceSync};
use crate::toolchain::{ActiveToolchain, MemoryProbe, ToolchainProfile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const STAMP: &str = "toolchain.json";
const LOG: &str = "toolchain.log";
const PROBE_SOURCE: &str = "int main(void) { volatile double x = 1.5; return (int)(x * 2.0) - 3; }\n";

/// Builds the custom toolchain, falling back to the system one on failure
pub struct ToolchainBuilder {
    runner: Arc<dyn CommandRunner>,
    memory: Arc<dyn MemoryProbe>,
}

impl ToolchainBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, memory: Arc<dyn MemoryProbe>) -> Self {
        Self { runner, memory }
    }

    /// The profile requested from a custom build under this run's layout
    pub fn requested_profile(ctx: &PipelineContext) -> ToolchainProfile {
        let toolchain = &ctx.config.toolchain;
        let profile = ToolchainProfile::custom(
            &ctx.paths.under_root(&toolchain.install_dir),
            &toolchain.target_isa,
        );
        match &toolchain.pgo_profile {
            Some(profdata) => profile.with_profile_data(&ctx.paths.under_root(profdata)),
            None => profile,
        }
    }

    /// Produce the toolchain for this run
    ///
    /// Insufficient memory is a hard stop raised before anything touches
    /// the network or the filesystem. Any failure of the custom build is
    /// absorbed: the system toolchain is installed instead and the result
    /// is tagged "system-fallback". Only when that install fails too does
    /// the run abort.
    pub async fn build(
        &self,
        requested: &ToolchainProfile,
        ctx: &mut PipelineContext,
    ) -> Result<ActiveToolchain, PipelineError> {
        self.check_memory(ctx)?;

        match self.build_custom(requested, ctx).await {
            Ok(()) => {
                let active = ActiveToolchain::new(requested.clone());
                if let Err(e) = write_stamp(&ctx.paths.stamp(STAMP), &active) {
                    ctx.warn(format!("could not record toolchain stamp: {}", e));
                }
                ctx.note(format!(
                    "custom toolchain ready at {} ({})",
                    requested.prefix.display(),
                    requested.features().join(", ")
                ));
                Ok(active)
            }
            Err(custom_err) => {
                let reason = custom_err.to_string();
                ctx.warn(format!(
                    "custom toolchain build failed, falling back to system toolchain: {}",
                    reason
                ));
                self.install_fallback(ctx, reason).await
            }
        }
    }

    fn check_memory(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let required_mb = ctx.config.toolchain.min_memory_gb * 1024;
        match self.memory.available_mb() {
            Ok(available_mb) if available_mb < required_mb => {
                Err(PipelineError::ResourceInsufficient {
                    required_mb,
                    available_mb,
                })
            }
            Ok(available_mb) => {
                debug!("{} MB available, {} MB required", available_mb, required_mb);
                Ok(())
            }
            Err(e) => {
                ctx.warn(format!("could not determine available memory ({}), continuing", e));
                Ok(())
            }
        }
    }

    async fn build_custom(
        &self,
        requested: &ToolchainProfile,
        ctx: &mut PipelineContext,
    ) -> Result<(), PipelineError> {
        let config = ctx.config.toolchain.clone();
        let source = ResourceSpec::from_config(&config.source, &ctx.paths);
        let sync = ResourceSync::new(self.runner.clone(), ctx.config.fetch_timeout())
            .with_env(ctx.env.clone());
        let synced = sync.sync(&source).await.map_err(|e| failure("sync", e.to_string()))?;
        for warning in &synced.warnings {
            ctx.warn(warning.clone());
        }

        let build_dir = ctx.paths.under_root(&config.build_dir);
        let vars = TemplateVars::new()
            .set_path("source_dir", &source.path)
            .set_path("build_dir", &build_dir)
            .set_path("install_dir", &requested.prefix)
            .set("target_isa", requested.target_isa.clone().unwrap_or_default())
            .set("jobs", jobs(ctx).to_string());
        let timeout = config.build_timeout_secs.map(Duration::from_secs);

        for (step, template) in [
            ("configure", &config.configure),
            ("compile", &config.compile),
            ("install", &config.install),
        ] {
            info!("Toolchain {}", step);
            self.run_step(ctx, step, template, &vars, timeout).await?;
        }

        self.probe(requested, ctx).await
    }

    async fn run_step(
        &self,
        ctx: &PipelineContext,
        step: &str,
        template: &CommandTemplate,
        vars: &TemplateVars,
        timeout: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let cmd = template
            .render(vars)
            .envs(&ctx.env)
            .timeout(timeout)
            .log_to(ctx.paths.log(LOG));
        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| failure(step, e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(failure(step, output.diagnostic()))
        }
    }

    /// Compile a trivial program with the freshly installed compiler
    async fn probe(&self, requested: &ToolchainProfile, ctx: &PipelineContext) -> Result<(), PipelineError> {
        let cc = requested
            .tool("CC")
            .ok_or_else(|| failure("probe", "profile has no C compiler".to_string()))?;

        let scratch = &ctx.paths.scratch;
        std::fs::create_dir_all(scratch).map_err(|e| failure("probe", e.to_string()))?;
        let source = scratch.join("probe.c");
        std::fs::write(&source, PROBE_SOURCE).map_err(|e| failure("probe", e.to_string()))?;

        let mut cmd = CommandSpec::new(cc.to_string_lossy().into_owned()).arg("-O2");
        if let Some(isa) = &requested.target_isa {
            cmd = cmd.arg(format!("-march={}", isa));
        }
        let cmd = cmd
            .path_arg(&source)
            .arg("-o")
            .path_arg(&scratch.join("probe"))
            .envs(&ctx.env)
            .log_to(ctx.paths.log(LOG));

        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| failure("probe", e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(failure("probe", output.diagnostic()))
        }
    }

    async fn install_fallback(
        &self,
        ctx: &mut PipelineContext,
        custom_reason: String,
    ) -> Result<ActiveToolchain, PipelineError> {
        let cmd = ctx
            .config
            .toolchain
            .fallback_install
            .render(&TemplateVars::new())
            .envs(&ctx.env)
            .log_to(ctx.paths.log(LOG));

        let fallback_err = match self.runner.run(&cmd).await {
            Ok(output) if output.success() => None,
            Ok(output) => Some(output.diagnostic()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(fallback) = fallback_err {
            return Err(PipelineError::ToolchainUnavailable {
                custom: custom_reason,
                fallback,
            });
        }

        let profile = ToolchainProfile::system_fallback(&ctx.config.toolchain.fallback_prefix);
        ctx.note(format!(
            "using system toolchain under {}",
            profile.prefix.display()
        ));
        Ok(ActiveToolchain::fallback(profile, custom_reason))
    }

    /// Toolchain recorded by an earlier successful custom build
    ///
    /// Only valid while the recorded compiler still exists.
    pub fn load_stamp(ctx: &PipelineContext) -> Option<ActiveToolchain> {
        let content = std::fs::read_to_string(ctx.paths.stamp(STAMP)).ok()?;
        let active: ActiveToolchain = serde_json::from_str(&content).ok()?;
        let cc = active.profile.tool("CC")?;
        cc.exists().then_some(active)
    }

    pub fn stamp_path(ctx: &PipelineContext) -> PathBuf {
        ctx.paths.stamp(STAMP)
    }
}

fn write_stamp(path: &Path, active: &ActiveToolchain) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(active)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

fn failure(step: &str, reason: String) -> PipelineError {
    PipelineError::ToolchainBuildFailure {
        step: step.to_string(),
        reason,
    }
}

/// Parallelism for external builds
pub fn jobs(ctx: &PipelineContext) -> usize {
    ctx.config.build.jobs.unwrap_or_else(num_cpus::get).max(1)
}
