//! Pipeline execution: stages, orchestrator and run guard

pub mod engine;
pub mod guard;
pub mod report;
pub mod stages;

pub use engine::{EventHandler, ExecutionEvent, PipelineOrchestrator, RunFailure, RunOptions};
pub use guard::RunGuard;
pub use stages::{standard_stages, PatchPhase};
