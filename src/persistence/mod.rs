//! Persistence layer for run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

pub use crate::core::ExecutionStatus;
use crate::core::{PipelineContext, StageState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run ID
    pub run_id: Uuid,

    /// Pipeline name from the configuration
    pub pipeline_name: String,

    /// Final status
    pub status: ExecutionStatus,

    /// "custom-built" or "system-fallback", when a toolchain was bound
    pub toolchain: Option<String>,

    /// Global optimization evidence score
    pub verification_score: Option<u32>,

    pub failed_stage: Option<String>,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run ended
    pub completed_at: Option<DateTime<Utc>>,

    /// Stages that completed or were skipped
    pub finished_stages: usize,

    pub total_stages: usize,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run, replacing any earlier record with the same ID
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    runs: tokio::sync::RwLock<Vec<RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            runs: tokio::sync::RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.retain(|r| r.run_id != run.run_id);
        runs.push(run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let runs = self.runs.read().await;
        Ok(runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut runs = self.runs.read().await.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Create a summary from a run's context
pub fn create_summary(ctx: &PipelineContext) -> RunSummary {
    let state = &ctx.state;
    RunSummary {
        run_id: ctx.run_id,
        pipeline_name: ctx.config.name.clone(),
        status: state.status,
        toolchain: ctx.active_toolchain().map(|t| t.tag().to_string()),
        verification_score: ctx.evidence.as_ref().map(|e| e.score),
        failed_stage: state.failed_stage.map(|s| s.as_str().to_string()),
        started_at: state.started_at.unwrap_or_else(Utc::now),
        completed_at: state.completed_at,
        finished_stages: state
            .stages
            .iter()
            .filter(|r| matches!(r.state, StageState::Completed { .. } | StageState::Skipped { .. }))
            .count(),
        total_stages: state.stages.len(),
    }
}
