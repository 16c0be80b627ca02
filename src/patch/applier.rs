//! Patch application

use crate::core::{PatchMarker, PipelineError};
use crate::patch::{PatchOperation, PatchSet, SubstitutionRule};
use crate::runner::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of applying a whole patch set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub set: String,
    pub applied: Vec<String>,
    pub duration: Duration,
}

/// Applies patch sets to a target tree
pub struct PatchApplier {
    runner: Arc<dyn CommandRunner>,
    env: BTreeMap<String, String>,
    log_file: Option<PathBuf>,
}

impl PatchApplier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            env: BTreeMap::new(),
            log_file: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Apply every operation in order
    ///
    /// Stops at the first failing operation with `PatchConflict` carrying
    /// its 0-based index. Operations before it stay applied; nothing is
    /// rolled back.
    pub async fn apply(&self, set: &PatchSet, target: &Path) -> Result<ApplyResult, PipelineError> {
        let start = Instant::now();
        let mut applied = Vec::with_capacity(set.len());

        info!("Applying {} operations from {}", set.len(), set.name());
        for (index, operation) in set.operations().iter().enumerate() {
            let name = operation.name();
            debug!("[{}/{}] {}", index + 1, set.len(), name);
            self.apply_operation(operation, target)
                .await
                .map_err(|reason| PipelineError::PatchConflict {
                    set: set.name().to_string(),
                    index,
                    operation: name.clone(),
                    reason,
                })?;
            applied.push(name);
        }

        Ok(ApplyResult {
            set: set.name().to_string(),
            applied,
            duration: start.elapsed(),
        })
    }

    async fn apply_operation(&self, operation: &PatchOperation, target: &Path) -> Result<(), String> {
        match operation {
            PatchOperation::Diff { path, .. } => self.apply_diff(path, target).await,
            PatchOperation::DomainSubstitution { rules, files } => {
                let changed = substitute(rules, files, target)?;
                debug!("domain substitution changed {} files", changed);
                Ok(())
            }
            PatchOperation::Prune { paths } => {
                let removed = prune(paths, target)?;
                debug!("pruned {} paths", removed);
                Ok(())
            }
        }
    }

    /// `git apply` first; `patch -p1` when a dry run says it can do better
    async fn apply_diff(&self, patch: &Path, target: &Path) -> Result<(), String> {
        let git = self
            .command("git")
            .args(["apply", "--ignore-whitespace", "--ignore-space-change"])
            .path_arg(patch)
            .cwd(target);
        let primary = self.runner.run(&git).await.map_err(|e| e.to_string())?;
        if primary.success() {
            return Ok(());
        }

        let fallback = |dry_run: bool| {
            let cmd = self
                .command("patch")
                .args(["-p1", "--forward", "--batch", "--ignore-whitespace", "-i"])
                .path_arg(patch)
                .cwd(target);
            if dry_run {
                cmd.arg("--dry-run")
            } else {
                cmd
            }
        };

        let dry = self.runner.run(&fallback(true)).await.map_err(|e| e.to_string())?;
        if dry.success() {
            let real = self.runner.run(&fallback(false)).await.map_err(|e| e.to_string())?;
            if real.success() {
                debug!("{} applied with patch -p1", patch.display());
                return Ok(());
            }
        }

        Err(primary.diagnostic())
    }

    fn command(&self, program: &str) -> CommandSpec {
        let cmd = CommandSpec::new(program).envs(&self.env);
        match &self.log_file {
            Some(log) => cmd.log_to(log),
            None => cmd,
        }
    }
}

/// Markers found and missing in a patched tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerCheck {
    pub verified: usize,
    pub missing: Vec<PatchMarker>,
}

impl MarkerCheck {
    pub fn total(&self) -> usize {
        self.verified + self.missing.len()
    }
}

/// Look for each marker's text in its file
///
/// A missing or unreadable file counts as a missing marker. Absence only
/// hints that a patch did not land as expected; it never fails the set.
pub fn check_markers(markers: &[PatchMarker], target: &Path) -> MarkerCheck {
    let mut check = MarkerCheck::default();
    for marker in markers {
        let found = std::fs::read(target.join(&marker.file))
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .to_lowercase()
                    .contains(&marker.contains.to_lowercase())
            })
            .unwrap_or(false);
        if found {
            debug!("marker {:?} found in {}", marker.contains, marker.file.display());
            check.verified += 1;
        } else {
            check.missing.push(marker.clone());
        }
    }
    check
}

/// Rewrite listed files in place; returns how many changed
fn substitute(rules: &[SubstitutionRule], files: &[PathBuf], target: &Path) -> Result<usize, String> {
    let mut changed = 0;
    for file in files {
        let path = target.join(file);
        if !path.is_file() {
            continue;
        }
        let bytes = std::fs::read(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
        let Ok(original) = String::from_utf8(bytes) else {
            debug!("skipping non-UTF-8 file {}", path.display());
            continue;
        };

        let mut content = original.clone();
        for rule in rules {
            content = rule
                .pattern
                .replace_all(&content, rule.replacement.as_str())
                .into_owned();
        }
        if content != original {
            std::fs::write(&path, content).map_err(|e| format!("{}: {}", path.display(), e))?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Remove listed paths; returns how many existed
fn prune(paths: &[PathBuf], target: &Path) -> Result<usize, String> {
    let mut removed = 0;
    for relative in paths {
        let path = target.join(relative);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if path.exists() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        result.map_err(|e| format!("{}: {}", path.display(), e))?;
        removed += 1;
    }
    Ok(removed)
}
