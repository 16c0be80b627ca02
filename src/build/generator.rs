//! Build configuration generation

use crate::core::{PipelineContext, PipelineError, TemplateVars};
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const LOG: &str = "config.log";
const RESOLVED_ARGS_LOG: &str = "resolved-args.log";

/// A generated build configuration, ready for the build tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigHandle {
    pub out_dir: PathBuf,
    pub args_file: PathBuf,
    pub resolved_args_log: PathBuf,
}

/// Merges the flag manifest into the target build system's configuration
pub struct BuildConfigGenerator {
    runner: Arc<dyn CommandRunner>,
}

impl BuildConfigGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Write `args.gn`, run the generation step and log the resolved options
    ///
    /// The arguments file is the static manifest, then the privacy flag
    /// fragment, then a section pointing at the active toolchain. A missing
    /// manifest or a rejected configuration is fatal; a failed listing of
    /// resolved options is only a warning.
    pub async fn generate(&self, ctx: &mut PipelineContext) -> Result<ConfigHandle, PipelineError> {
        let manifest_path = ctx.paths.under_root(&ctx.config.build.flags_manifest);
        let manifest = std::fs::read_to_string(&manifest_path).map_err(|e| {
            PipelineError::ConfigGenerationFailure(format!(
                "optimization flag manifest {} unreadable: {}",
                manifest_path.display(),
                e
            ))
        })?;

        let out_dir = ctx.paths.source.join(&ctx.config.build.out_dir);
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| PipelineError::io(format!("creating {}", out_dir.display()), e))?;

        let mut args = String::new();
        let _ = writeln!(args, "# Generated by ultibuild, run {}", ctx.run_id);
        let _ = writeln!(args, "\n# optimization manifest: {}", manifest_path.display());
        args.push_str(manifest.trim_end());
        args.push('\n');

        let privacy = &ctx.config.patches.privacy;
        let fragment_path = ctx
            .config
            .resource(&privacy.resource)
            .map(|r| ctx.paths.resource(r).join(&privacy.flags_fragment));
        match fragment_path.as_ref().map(std::fs::read_to_string) {
            Some(Ok(fragment)) => {
                let _ = writeln!(args, "\n# privacy flags");
                args.push_str(fragment.trim_end());
                args.push('\n');
            }
            _ => ctx.warn("privacy flag fragment not found, continuing without it"),
        }

        match ctx.active_toolchain() {
            Some(toolchain) => {
                args.push('\n');
                args.push_str(&toolchain.profile.build_args());
            }
            None => ctx.warn("no active toolchain, build uses the target's default compiler"),
        }

        let args_file = out_dir.join("args.gn");
        std::fs::write(&args_file, &args)
            .map_err(|e| PipelineError::io(format!("writing {}", args_file.display()), e))?;
        info!("Wrote {}", args_file.display());

        let vars = TemplateVars::new().set_path("out_dir", &out_dir);
        let env = ctx.toolchain_env();

        let gen = ctx
            .config
            .build
            .gen
            .render(&vars)
            .cwd(&ctx.paths.source)
            .envs(&env)
            .log_to(ctx.paths.log(LOG));
        let output = self
            .runner
            .run(&gen)
            .await
            .map_err(|e| PipelineError::ConfigGenerationFailure(e.to_string()))?;
        if !output.success() {
            return Err(PipelineError::ConfigGenerationFailure(output.diagnostic()));
        }

        let resolved_args_log = ctx.paths.log(RESOLVED_ARGS_LOG);
        let list = ctx
            .config
            .build
            .list_args
            .render(&vars)
            .cwd(&ctx.paths.source)
            .envs(&env);
        match self.runner.run(&list).await {
            Ok(output) if output.success() => {
                if let Err(e) = std::fs::write(&resolved_args_log, &output.stdout) {
                    ctx.warn(format!("could not write {}: {}", resolved_args_log.display(), e));
                }
            }
            Ok(output) => ctx.warn(format!("listing resolved args failed: {}", output.diagnostic())),
            Err(e) => ctx.warn(format!("listing resolved args failed: {}", e)),
        }

        Ok(ConfigHandle {
            out_dir,
            args_file,
            resolved_args_log,
        })
    }
}
