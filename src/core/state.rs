//! Execution state models

use crate::core::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    /// Every stage completed or was skipped
    Completed,
    /// A stage failed fatally
    Failed,
    /// The process was interrupted
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

/// State of a single stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageState {
    /// Not reached yet
    Pending,
    /// Currently executing
    Running { started_at: DateTime<Utc> },
    /// Executed successfully
    Completed {
        summary: String,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Precondition already held
    Skipped { reason: String },
    /// Raised a fatal error
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
}

impl StageState {
    /// Check if stage is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Completed { .. } | StageState::Skipped { .. } | StageState::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running { .. } => "running",
            StageState::Completed { .. } => "completed",
            StageState::Skipped { .. } => "skipped",
            StageState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: StageId,
    pub state: StageState,
}

/// Overall run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run ID
    pub run_id: Uuid,

    /// Current run status
    pub status: ExecutionStatus,

    /// When the run started
    pub started_at: Option<DateTime<Utc>>,

    /// When the run completed, failed or was cancelled
    pub completed_at: Option<DateTime<Utc>>,

    /// One record per stage, in execution order
    pub stages: Vec<StageRecord>,

    /// Stage that failed, if any
    pub failed_stage: Option<StageId>,
}

impl RunState {
    /// Create a new run state with every stage pending
    pub fn new(run_id: Uuid, stages: &[StageId]) -> Self {
        Self {
            run_id,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            stages: stages
                .iter()
                .map(|id| StageRecord {
                    id: *id,
                    state: StageState::Pending,
                })
                .collect(),
            failed_stage: None,
        }
    }

    /// Mark run as started
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark run as completed
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark run as failed at `stage`
    pub fn fail(&mut self, stage: StageId) {
        self.status = ExecutionStatus::Failed;
        self.failed_stage = Some(stage);
        self.completed_at = Some(Utc::now());
    }

    /// Mark run as cancelled
    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn set(&mut self, id: StageId, state: StageState) {
        if let Some(record) = self.stages.iter_mut().find(|r| r.id == id) {
            record.state = state;
        }
    }

    pub fn get(&self, id: StageId) -> Option<&StageState> {
        self.stages.iter().find(|r| r.id == id).map(|r| &r.state)
    }

    pub fn count(&self, label: &str) -> usize {
        self.stages
            .iter()
            .filter(|r| r.state.label() == label)
            .count()
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        let done = self.stages.iter().filter(|r| r.state.is_terminal()).count();
        done as f64 / self.stages.len() as f64
    }
}
