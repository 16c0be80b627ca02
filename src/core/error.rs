//! Pipeline error taxonomy

use crate::runner::RunnerError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by pipeline stages
///
/// Soft conditions (stale sync, toolchain fallback, missing optional
/// artifact) never become errors; stages absorb and log them. Of the
/// variants below only `VerificationInconclusive` is non-fatal.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required host tools are missing: {}", .tools.join(", "))]
    DependencyMissing { tools: Vec<String> },

    #[error(
        "insufficient memory: {available_mb} MB available, at least {required_mb} MB required"
    )]
    ResourceInsufficient { required_mb: u64, available_mb: u64 },

    #[error("resource `{resource}` could not be obtained: {reason}")]
    SyncUnavailable { resource: String, reason: String },

    #[error("custom toolchain build failed during {step}: {reason}")]
    ToolchainBuildFailure { step: String, reason: String },

    #[error("no usable toolchain: custom build failed ({custom}); system fallback failed ({fallback})")]
    ToolchainUnavailable { custom: String, fallback: String },

    #[error("active toolchain is already bound for this run")]
    ToolchainAlreadyBound,

    #[error("patch source for `{set}` is invalid: {reason}")]
    PatchSourceInvalid { set: String, reason: String },

    #[error("patch set `{set}` conflicted at operation {index} ({operation}): {reason}")]
    PatchConflict {
        set: String,
        index: usize,
        operation: String,
        reason: String,
    },

    #[error("build configuration generation failed: {0}")]
    ConfigGenerationFailure(String),

    #[error("build tool failed ({}); full log at {}\n{tail}", describe_exit(.exit_code), .log.display())]
    BuildToolFailure {
        exit_code: Option<i32>,
        log: PathBuf,
        tail: String,
    },

    #[error("verification inconclusive: {0}")]
    VerificationInconclusive(String),

    #[error("packaging failed: {0}")]
    PackagingFailure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl PipelineError {
    /// Wrap an I/O error with a description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the orchestrator must abort the run on this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::VerificationInconclusive(_))
    }
}
