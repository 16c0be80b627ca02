//! Stage definitions

use crate::core::{PipelineContext, PipelineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageId {
    DependencyCheck,
    EnvironmentSetup,
    ResourceSync,
    ToolchainSetup,
    PrivacyPatch,
    OptimizationPatch,
    ConfigGenerate,
    BuildExecute,
    Verify,
    Package,
    Report,
}

impl StageId {
    /// Every stage in the order the orchestrator runs them
    pub const ALL: [StageId; 11] = [
        StageId::DependencyCheck,
        StageId::EnvironmentSetup,
        StageId::ResourceSync,
        StageId::ToolchainSetup,
        StageId::PrivacyPatch,
        StageId::OptimizationPatch,
        StageId::ConfigGenerate,
        StageId::BuildExecute,
        StageId::Verify,
        StageId::Package,
        StageId::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::DependencyCheck => "dependency-check",
            StageId::EnvironmentSetup => "environment-setup",
            StageId::ResourceSync => "resource-sync",
            StageId::ToolchainSetup => "toolchain-setup",
            StageId::PrivacyPatch => "privacy-patch",
            StageId::OptimizationPatch => "optimization-patch",
            StageId::ConfigGenerate => "config-generate",
            StageId::BuildExecute => "build-execute",
            StageId::Verify => "verify",
            StageId::Package => "package",
            StageId::Report => "report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        StageId::ALL.iter().copied().find(|id| id.as_str() == s)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageId::DependencyCheck => "Check required host tools",
            StageId::EnvironmentSetup => "Create the working directory layout",
            StageId::ResourceSync => "Sync source and patch repositories",
            StageId::ToolchainSetup => "Build the custom toolchain or fall back to the system one",
            StageId::PrivacyPatch => "Apply the privacy patch set",
            StageId::OptimizationPatch => "Apply the optimization patch set",
            StageId::ConfigGenerate => "Generate the build configuration",
            StageId::BuildExecute => "Build the requested targets",
            StageId::Verify => "Score optimization evidence in the binary",
            StageId::Package => "Bundle and archive the artifacts",
            StageId::Report => "Write the consolidated report",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage's output is already present
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Output present; the stage is skipped for this reason
    Satisfied(String),
    Unsatisfied,
}

/// What a completed stage reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub summary: String,
}

impl StageOutcome {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

/// A named unit of work sequenced by the orchestrator
///
/// Stages are constructed once and never mutated; everything a run
/// produces lives in the [`PipelineContext`].
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Check whether this stage's output is already present and valid
    async fn precondition(&self, _ctx: &PipelineContext) -> Precondition {
        Precondition::Unsatisfied
    }

    /// Reload the results of a skipped stage into the context
    async fn restore(&self, _ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StageOutcome, PipelineError>;

    /// Remove partial output after a fatal error; logs are never touched
    async fn cleanup(&self, _ctx: &PipelineContext) {}
}
