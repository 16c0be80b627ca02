//! Target build execution

use crate::build::ConfigHandle;
use crate::core::{PipelineContext, PipelineError, TemplateVars};
use crate::runner::CommandRunner;
use crate::toolchain::jobs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const LOG: &str = "build.log";
const FAILURE_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub targets: Vec<String>,
    pub duration: Duration,
    pub log_path: PathBuf,
    pub jobs: usize,
}

/// Runs the target build tool once for every requested target
pub struct BuildExecutor {
    runner: Arc<dyn CommandRunner>,
}

impl BuildExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Build `targets`, streaming all output to `logs/build.log`
    ///
    /// A non-zero exit is fatal. Whatever the build produced before failing
    /// stays in the output directory.
    pub async fn execute(
        &self,
        handle: &ConfigHandle,
        targets: &[String],
        ctx: &PipelineContext,
    ) -> Result<BuildResult, PipelineError> {
        let jobs = jobs(ctx);
        let log_path = ctx.paths.log(LOG);
        let vars = TemplateVars::new()
            .set_path("out_dir", &handle.out_dir)
            .set("jobs", jobs.to_string())
            .set_list("targets", targets.to_vec());

        let cmd = ctx
            .config
            .build
            .build
            .render(&vars)
            .cwd(&ctx.paths.source)
            .envs(&ctx.toolchain_env())
            .timeout(ctx.config.build.timeout_secs.map(Duration::from_secs))
            .log_to(&log_path);

        info!("Building {} with {} jobs", targets.join(", "), jobs);
        let output = self.runner.run(&cmd).await.map_err(|e| PipelineError::BuildToolFailure {
            exit_code: None,
            log: log_path.clone(),
            tail: e.to_string(),
        })?;

        if !output.success() {
            return Err(PipelineError::BuildToolFailure {
                exit_code: output.exit_code,
                log: log_path,
                tail: output.tail(FAILURE_TAIL_LINES),
            });
        }

        Ok(BuildResult {
            targets: targets.to_vec(),
            duration: output.duration,
            log_path,
            jobs,
        })
    }
}
