//! ultibuild - builds an optimized, privacy-patched Chromium and verifies
//! which compiler optimizations actually landed in the binary

pub mod build;
pub mod cli;
pub mod core;
pub mod execution;
pub mod package;
pub mod patch;
pub mod persistence;
pub mod runner;
pub mod sync;
pub mod toolchain;
pub mod verify;

// Re-export commonly used types
pub use core::{BuildConfig, ExecutionStatus, PipelineContext, PipelineError, StageId};
pub use execution::{ExecutionEvent, PipelineOrchestrator, RunFailure, RunOptions};
pub use runner::{CommandRunner, ProcessRunner, ScriptedRunner};
pub use toolchain::{ActiveToolchain, ToolchainProfile};
pub use verify::EvidenceReport;
