//! Pipeline orchestrator - sequences the stages of one run

use crate::core::{
    ExecutionStatus, LogLevel, Precondition, PipelineContext, PipelineError, Stage, StageId,
    StageState,
};
use crate::execution::{report, standard_stages, RunGuard};
use crate::runner::CommandRunner;
use crate::toolchain::MemoryProbe;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        stages: usize,
    },
    StageStarted {
        stage: StageId,
    },
    StageSkipped {
        stage: StageId,
        reason: String,
    },
    StageWarning {
        stage: StageId,
        message: String,
    },
    StageCompleted {
        stage: StageId,
        summary: String,
        duration: Duration,
    },
    StageFailed {
        stage: StageId,
        error: String,
    },
    RunCompleted {
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Run-wide switches from the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Wipe the root directory before the environment is set up
    pub clean: bool,
    /// Skip the host tool check
    pub skip_deps: bool,
    /// Walk the stage list without running anything
    pub dry_run: bool,
}

/// A fatal stage error, with where to look next
#[derive(Debug, Error)]
#[error("stage {stage} failed: {error}\nlogs preserved in {}", .logs_dir.display())]
pub struct RunFailure {
    pub stage: StageId,
    #[source]
    pub error: PipelineError,
    pub logs_dir: PathBuf,
}

/// Top-level state machine
///
/// Stages run strictly in order. A stage whose precondition already holds
/// is restored from its recorded output and skipped. The first fatal error
/// marks the run failed, runs that stage's cleanup under a timeout, writes
/// the report and stops; logs are always preserved.
pub struct PipelineOrchestrator {
    stages: Vec<Box<dyn Stage>>,
    options: RunOptions,
    event_handlers: Vec<EventHandler>,
    cleanup_timeout: Duration,
}

impl PipelineOrchestrator {
    pub fn new(stages: Vec<Box<dyn Stage>>, options: RunOptions) -> Self {
        Self {
            stages,
            options,
            event_handlers: Vec::new(),
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }

    /// The standard eleven-stage pipeline
    pub fn standard(
        runner: Arc<dyn CommandRunner>,
        memory: Arc<dyn MemoryProbe>,
        options: RunOptions,
    ) -> Self {
        Self::new(standard_stages(runner, memory, options.clean), options)
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    fn emit(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    /// Stage identifiers in execution order
    pub fn plan(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    /// Run every stage against `ctx`
    pub async fn run(&self, ctx: &mut PipelineContext) -> Result<(), RunFailure> {
        if self.options.dry_run {
            self.walk_dry(ctx);
            return Ok(());
        }

        let guard = RunGuard::acquire(&ctx.paths);
        ctx.state.start();
        info!("Starting {} ({})", ctx.config.name, ctx.run_id);
        self.emit(ExecutionEvent::RunStarted {
            run_id: ctx.run_id,
            pipeline_name: ctx.config.name.clone(),
            stages: self.stages.len(),
        });

        for stage in &self.stages {
            if let Err(failure) = self.run_stage(stage.as_ref(), ctx).await {
                ctx.set_current_stage(None);
                if let Err(e) = report::write(ctx) {
                    warn!("could not write report: {}", e);
                }
                self.emit(ExecutionEvent::RunCompleted {
                    run_id: ctx.run_id,
                    status: ExecutionStatus::Failed,
                });
                guard.release();
                return Err(failure);
            }
        }

        ctx.set_current_stage(None);
        ctx.state.complete();
        info!("{} finished", ctx.config.name);
        self.emit(ExecutionEvent::RunCompleted {
            run_id: ctx.run_id,
            status: ExecutionStatus::Completed,
        });
        guard.release();
        Ok(())
    }

    fn walk_dry(&self, ctx: &mut PipelineContext) {
        for stage in &self.stages {
            let reason = "dry run".to_string();
            ctx.state.set(
                stage.id(),
                StageState::Skipped {
                    reason: reason.clone(),
                },
            );
            self.emit(ExecutionEvent::StageSkipped {
                stage: stage.id(),
                reason,
            });
        }
    }

    async fn run_stage(&self, stage: &dyn Stage, ctx: &mut PipelineContext) -> Result<(), RunFailure> {
        let id = stage.id();
        ctx.set_current_stage(Some(id));

        if id == StageId::DependencyCheck && self.options.skip_deps {
            self.skip(ctx, id, "--skip-deps".to_string());
            return Ok(());
        }

        if let Precondition::Satisfied(reason) = stage.precondition(ctx).await {
            match stage.restore(ctx).await {
                Ok(()) => {
                    self.skip(ctx, id, reason);
                    return Ok(());
                }
                Err(e) => ctx.warn(format!("{}: could not reuse earlier output ({}), re-running", id, e)),
            }
        }

        let started_at = Utc::now();
        let start = Instant::now();
        ctx.state.set(id, StageState::Running { started_at });
        self.emit(ExecutionEvent::StageStarted { stage: id });

        let log_mark = ctx.run_log.len();
        let result = stage.execute(ctx).await;

        let result = match result {
            Err(e) if !e.is_fatal() => {
                ctx.warn(e.to_string());
                Ok(crate::core::StageOutcome::new(format!("degraded: {}", e)))
            }
            other => other,
        };
        self.emit_warnings(ctx, id, log_mark);

        match result {
            Ok(outcome) => {
                ctx.state.set(
                    id,
                    StageState::Completed {
                        summary: outcome.summary.clone(),
                        started_at,
                        completed_at: Utc::now(),
                    },
                );
                self.emit(ExecutionEvent::StageCompleted {
                    stage: id,
                    summary: outcome.summary,
                    duration: start.elapsed(),
                });
                Ok(())
            }
            Err(e) => {
                error!("Stage {} failed: {}", id, e);
                ctx.state.set(
                    id,
                    StageState::Failed {
                        error: e.to_string(),
                        started_at,
                        failed_at: Utc::now(),
                    },
                );
                ctx.state.fail(id);
                self.emit(ExecutionEvent::StageFailed {
                    stage: id,
                    error: e.to_string(),
                });

                if tokio::time::timeout(self.cleanup_timeout, stage.cleanup(ctx))
                    .await
                    .is_err()
                {
                    warn!("cleanup for {} timed out", id);
                }

                Err(RunFailure {
                    stage: id,
                    error: e,
                    logs_dir: ctx.paths.logs.clone(),
                })
            }
        }
    }

    fn skip(&self, ctx: &mut PipelineContext, id: StageId, reason: String) {
        info!("Skipping {}: {}", id, reason);
        ctx.state.set(
            id,
            StageState::Skipped {
                reason: reason.clone(),
            },
        );
        self.emit(ExecutionEvent::StageSkipped { stage: id, reason });
    }

    fn emit_warnings(&self, ctx: &PipelineContext, id: StageId, from: usize) {
        for entry in ctx.run_log.iter().skip(from) {
            if entry.level == LogLevel::Warn {
                self.emit(ExecutionEvent::StageWarning {
                    stage: id,
                    message: entry.message.clone(),
                });
            }
        }
    }
}
