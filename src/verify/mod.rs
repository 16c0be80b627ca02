//! Heuristic optimization verification
//!
//! Classifies a built binary by pattern evidence: section names, ELF notes,
//! `.comment` strings, symbol-table shape and a bounded disassembly sample.
//! This is a classifier, not a prover. The indicator set lives in a
//! versioned [`EvidenceModel`] so it can change without touching the
//! scanning code.

pub mod inspect;
pub mod model;
pub mod report;

pub use inspect::{BinaryFacts, BinaryInspector, Instruction};
pub use model::{Category, EvidenceModel, FactSource, Indicator, Probe};
pub use report::{CategoryEvidence, EvidenceReport, IndicatorEvidence, Rating};

use crate::core::{PipelineError, VerifyConfig};
use crate::runner::CommandRunner;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Scores a binary against an evidence model
pub struct OptimizationVerifier {
    inspector: BinaryInspector,
    model: EvidenceModel,
    config: VerifyConfig,
}

impl OptimizationVerifier {
    pub fn new(runner: Arc<dyn CommandRunner>, config: VerifyConfig, model: EvidenceModel) -> Self {
        Self {
            inspector: BinaryInspector::new(runner, config.clone()),
            model,
            config,
        }
    }

    /// Build a verifier with the configured model file, or the built-in model
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: VerifyConfig) -> Result<Self, PipelineError> {
        let model = match &config.model_file {
            Some(path) => EvidenceModel::from_file(path),
            None => EvidenceModel::builtin(),
        }
        .map_err(|e| PipelineError::Config(format!("evidence model: {:#}", e)))?;
        Ok(Self::new(runner, config, model))
    }

    /// Inspect `binary` and score every category
    ///
    /// A missing, empty or non-executable binary is
    /// `VerificationInconclusive`, which never fails the run.
    pub async fn verify(&self, binary: &Path) -> Result<EvidenceReport, PipelineError> {
        check_executable(binary)?;

        let facts = self.inspector.inspect(binary, &self.model.sources()).await;
        let report = EvidenceReport::evaluate(
            &self.model,
            &facts,
            binary.to_path_buf(),
            self.config.excellent_threshold,
            self.config.good_threshold,
        );
        info!(
            "Optimization evidence: {}% ({})",
            report.score,
            report.rating.as_str()
        );
        Ok(report)
    }
}

fn check_executable(binary: &Path) -> Result<(), PipelineError> {
    let metadata = std::fs::metadata(binary).map_err(|e| {
        PipelineError::VerificationInconclusive(format!("{}: {}", binary.display(), e))
    })?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(PipelineError::VerificationInconclusive(format!(
            "{} is empty or not a regular file",
            binary.display()
        )));
    }
    if !is_executable(&metadata) {
        return Err(PipelineError::VerificationInconclusive(format!(
            "{} is not executable",
            binary.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
