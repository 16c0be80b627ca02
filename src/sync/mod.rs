//! Idempotent resource sync
//!
//! Brings a git repository to a ready state: clone when absent, update when
//! present, then check out the pinned revision when a pin file names one.

use crate::core::{PipelineError, PipelinePaths, ResourceConfig};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One external resource to sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub url: String,

    /// Local checkout
    pub path: PathBuf,

    /// File whose first non-empty line names the revision to check out
    pub pin_file: Option<PathBuf>,

    pub branch: Option<String>,
}

impl ResourceSpec {
    pub fn from_config(resource: &ResourceConfig, paths: &PipelinePaths) -> Self {
        Self {
            name: resource.name.clone(),
            url: resource.url.clone(),
            path: paths.resource(resource),
            pin_file: resource.pin_file.as_ref().map(|p| paths.under_root(p)),
            branch: resource.branch.clone(),
        }
    }
}

/// What a sync did to the local checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    Cloned,
    Updated,
    /// Present but the update failed; the existing checkout is used
    Stale { reason: String },
    /// Reloaded from an earlier run without touching the checkout
    Restored,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Cloned => "cloned",
            SyncAction::Updated => "updated",
            SyncAction::Stale { .. } => "stale",
            SyncAction::Restored => "restored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub name: String,
    pub path: PathBuf,
    pub action: SyncAction,

    /// Resolved HEAD after the sync
    pub revision: String,

    /// Revision named by the pin file, when one was read
    pub pinned: Option<String>,

    pub warnings: Vec<String>,
}

/// Git-backed resource sync
pub struct ResourceSync {
    runner: Arc<dyn CommandRunner>,
    fetch_timeout: Duration,
    env: BTreeMap<String, String>,
}

impl ResourceSync {
    pub fn new(runner: Arc<dyn CommandRunner>, fetch_timeout: Duration) -> Self {
        Self {
            runner,
            fetch_timeout,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Sync one resource
    ///
    /// Fails when the resource cannot be obtained at all (clone failure),
    /// when a fetch times out, or when a readable pin cannot be checked out.
    /// A failed update of an existing checkout and an unreadable pin file
    /// are warnings.
    pub async fn sync(&self, spec: &ResourceSpec) -> Result<SyncResult, PipelineError> {
        let mut warnings = Vec::new();
        let pinned = self.read_pin(spec, &mut warnings);

        let action = if spec.path.exists() {
            self.update(spec, pinned.is_some(), &mut warnings).await?
        } else {
            self.clone_fresh(spec).await?;
            SyncAction::Cloned
        };

        if let Some(pin) = &pinned {
            if self.at_revision(&spec.path, pin).await {
                debug!("{} already at {}", spec.name, pin);
            } else {
                info!("Checking out {} at {}", spec.name, pin);
                let output = self
                    .git(&spec.path, ["checkout", "--quiet", pin.as_str()], None)
                    .await
                    .map_err(|e| unavailable(spec, e.to_string()))?;
                if !output.success() {
                    return Err(unavailable(
                        spec,
                        format!("checkout of pinned revision {} failed: {}", pin, output.diagnostic()),
                    ));
                }
            }
        }

        let revision = match self.revision(&spec.path).await {
            Some(rev) => rev,
            None => {
                warnings.push(format!("{}: could not resolve HEAD", spec.name));
                "unknown".to_string()
            }
        };

        Ok(SyncResult {
            name: spec.name.clone(),
            path: spec.path.clone(),
            action,
            revision,
            pinned,
            warnings,
        })
    }

    /// Present and checked out at a readable pin
    ///
    /// Unpinned resources always need their update step, so they are
    /// never considered synced.
    pub async fn is_synced(&self, spec: &ResourceSpec) -> bool {
        if !spec.path.exists() {
            return false;
        }
        let mut ignored = Vec::new();
        match self.read_pin(spec, &mut ignored) {
            Some(pin) => self.at_revision(&spec.path, &pin).await,
            None => false,
        }
    }

    /// Resolved HEAD of a checkout
    pub async fn revision(&self, path: &Path) -> Option<String> {
        self.rev_parse(path, "HEAD").await
    }

    async fn clone_fresh(&self, spec: &ResourceSpec) -> Result<(), PipelineError> {
        if let Some(parent) = spec.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::io(format!("creating {}", parent.display()), e))?;
        }

        info!("Cloning {} from {}", spec.name, spec.url);
        let mut cmd = CommandSpec::new("git").arg("clone");
        if let Some(branch) = &spec.branch {
            cmd = cmd.args(["--branch", branch.as_str()]);
        }
        let cmd = cmd
            .arg(spec.url.clone())
            .path_arg(&spec.path)
            .envs(&self.env)
            .timeout(Some(self.fetch_timeout));

        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| unavailable(spec, e.to_string()))?;
        if !output.success() {
            return Err(unavailable(spec, format!("clone failed: {}", output.diagnostic())));
        }
        Ok(())
    }

    async fn update(
        &self,
        spec: &ResourceSpec,
        pinned: bool,
        warnings: &mut Vec<String>,
    ) -> Result<SyncAction, PipelineError> {
        let args: &[&str] = if pinned {
            &["fetch", "--tags", "origin"]
        } else {
            &["pull", "--ff-only"]
        };

        let reason = match self.git(&spec.path, args.iter().copied(), Some(self.fetch_timeout)).await {
            Ok(output) if output.success() => return Ok(SyncAction::Updated),
            Ok(output) => output.diagnostic(),
            Err(e @ RunnerError::Timeout { .. }) => return Err(unavailable(spec, e.to_string())),
            Err(e) => e.to_string(),
        };

        let message = format!("{}: update failed, using existing checkout ({})", spec.name, reason);
        warn!("{}", message);
        warnings.push(message);
        Ok(SyncAction::Stale { reason })
    }

    fn read_pin(&self, spec: &ResourceSpec, warnings: &mut Vec<String>) -> Option<String> {
        let pin_file = spec.pin_file.as_ref()?;
        match std::fs::read_to_string(pin_file) {
            Ok(content) => {
                let pin = content
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string);
                if pin.is_none() {
                    warnings.push(format!(
                        "{}: pin file {} is empty, using branch tip",
                        spec.name,
                        pin_file.display()
                    ));
                }
                pin
            }
            Err(e) => {
                let message = format!(
                    "{}: pin file {} unreadable ({}), using branch tip",
                    spec.name,
                    pin_file.display(),
                    e
                );
                warn!("{}", message);
                warnings.push(message);
                None
            }
        }
    }

    async fn at_revision(&self, path: &Path, pin: &str) -> bool {
        let head = self.rev_parse(path, "HEAD").await;
        let target = self.rev_parse(path, &format!("{}^{{commit}}", pin)).await;
        matches!((head, target), (Some(h), Some(t)) if h == t)
    }

    async fn rev_parse(&self, path: &Path, rev: &str) -> Option<String> {
        match self.git(path, ["rev-parse", "--verify", "--quiet", rev], None).await {
            Ok(output) if output.success() => {
                let rev = output.stdout.trim().to_string();
                (!rev.is_empty()).then_some(rev)
            }
            _ => None,
        }
    }

    async fn git<'a, I>(&self, path: &Path, args: I, timeout: Option<Duration>) -> Result<CommandOutput, RunnerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let cmd = CommandSpec::new("git")
            .arg("-C")
            .path_arg(path)
            .args(args)
            .envs(&self.env)
            .timeout(timeout);
        self.runner.run(&cmd).await
    }
}

fn unavailable(spec: &ResourceSpec, reason: String) -> PipelineError {
    PipelineError::SyncUnavailable {
        resource: spec.name.clone(),
        reason,
    }
}
