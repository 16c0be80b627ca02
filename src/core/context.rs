//! Pipeline context - the explicit state of one run

use crate::build::{BuildResult, ConfigHandle};
use crate::core::{BuildConfig, PipelineError, ResourceConfig, RunState, StageId};
use crate::patch::ApplyResult;
use crate::sync::SyncResult;
use crate::toolchain::ActiveToolchain;
use crate::verify::EvidenceReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Directory layout derived from the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePaths {
    pub root: PathBuf,

    /// Checkout of the source resource
    pub source: PathBuf,

    /// Parent of the patch collections
    pub patches: PathBuf,

    /// Toolchain checkout, build and install tree
    pub toolchain: PathBuf,

    pub logs: PathBuf,
    pub artifacts: PathBuf,

    /// Stage stamps that survive across runs
    pub stamps: PathBuf,

    /// Per-run temporary files, removed when the run ends
    pub scratch: PathBuf,
}

impl PipelinePaths {
    pub fn new(config: &BuildConfig, run_id: Uuid) -> Self {
        let root = config.root_dir.clone();
        let source = config
            .resource(&config.build.source_resource)
            .map(|r| root.join(&r.path))
            .unwrap_or_else(|| root.join("src"));

        Self {
            source,
            patches: root.join("patches"),
            toolchain: root.join("toolchain"),
            logs: root.join("logs"),
            artifacts: root.join("artifacts"),
            stamps: root.join(".stamps"),
            scratch: root.join(".scratch").join(run_id.to_string()),
            root,
        }
    }

    /// Local checkout of a resource
    pub fn resource(&self, resource: &ResourceConfig) -> PathBuf {
        self.root.join(&resource.path)
    }

    /// Resolve a path relative to the root
    pub fn under_root(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    pub fn stamp(&self, name: &str) -> PathBuf {
        self.stamps.join(name)
    }

    pub fn log(&self, name: &str) -> PathBuf {
        self.logs.join(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
}

/// One line of the run log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Option<StageId>,
    pub level: LogLevel,
    pub message: String,
}

/// State of one pipeline invocation
///
/// Constructed explicitly by the caller and owned by the orchestrator for
/// the duration of the run. Compiler selection lives here as an
/// [`ActiveToolchain`] and reaches external commands only through
/// [`PipelineContext::toolchain_env`]; the process environment is never
/// modified.
#[derive(Debug)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub config: BuildConfig,
    pub paths: PipelinePaths,

    /// Environment overrides applied to every external command
    pub env: BTreeMap<String, String>,

    pub run_log: Vec<RunLogEntry>,
    current_stage: Option<StageId>,
    active_toolchain: Option<ActiveToolchain>,

    pub sync_results: Vec<SyncResult>,
    pub patch_results: Vec<ApplyResult>,
    pub config_handle: Option<ConfigHandle>,
    pub build_result: Option<BuildResult>,
    pub evidence: Option<EvidenceReport>,
    pub package_path: Option<PathBuf>,
    pub state: RunState,
}

impl PipelineContext {
    pub fn new(config: BuildConfig) -> Self {
        Self::with_run_id(config, Uuid::new_v4())
    }

    pub fn with_run_id(config: BuildConfig, run_id: Uuid) -> Self {
        let paths = PipelinePaths::new(&config, run_id);
        let env = config.environment.clone();
        Self {
            run_id,
            paths,
            env,
            run_log: Vec::new(),
            current_stage: None,
            active_toolchain: None,
            sync_results: Vec::new(),
            patch_results: Vec::new(),
            config_handle: None,
            build_result: None,
            evidence: None,
            package_path: None,
            state: RunState::new(run_id, &StageId::ALL),
            config,
        }
    }

    pub fn current_stage(&self) -> Option<StageId> {
        self.current_stage
    }

    pub fn set_current_stage(&mut self, stage: Option<StageId>) {
        self.current_stage = stage;
    }

    /// Record an informational line in the run log
    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.push_log(LogLevel::Info, message);
    }

    /// Record a soft failure that the current stage absorbed
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.push_log(LogLevel::Warn, message);
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.run_log.push(RunLogEntry {
            timestamp: Utc::now(),
            stage: self.current_stage,
            level,
            message,
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &RunLogEntry> {
        self.run_log.iter().filter(|e| e.level == LogLevel::Warn)
    }

    /// Bind the toolchain for the rest of the run; allowed exactly once
    pub fn bind_toolchain(&mut self, toolchain: ActiveToolchain) -> Result<(), PipelineError> {
        if self.active_toolchain.is_some() {
            return Err(PipelineError::ToolchainAlreadyBound);
        }
        self.active_toolchain = Some(toolchain);
        Ok(())
    }

    pub fn active_toolchain(&self) -> Option<&ActiveToolchain> {
        self.active_toolchain.as_ref()
    }

    /// Environment for commands that compile or inspect code
    ///
    /// The base overrides plus the active toolchain's compiler selection
    /// and flags, with its `bin` directory at the front of PATH.
    pub fn toolchain_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let Some(toolchain) = &self.active_toolchain {
            env.extend(toolchain.profile.env_overrides());
            let inherited = env
                .get("PATH")
                .cloned()
                .or_else(|| std::env::var("PATH").ok());
            if let Some(path) = prepend_path(&[toolchain.profile.bin_dir()], inherited.as_deref())
            {
                env.insert("PATH".to_string(), path);
            }
        }
        env
    }

    /// Revision of every synced resource, for provenance
    pub fn revisions(&self) -> BTreeMap<String, String> {
        self.sync_results
            .iter()
            .map(|r| (r.name.clone(), r.revision.clone()))
            .collect()
    }
}

/// Put `front` ahead of an inherited PATH value
pub fn prepend_path(front: &[PathBuf], inherited: Option<&str>) -> Option<String> {
    let mut entries: Vec<PathBuf> = front.to_vec();
    if let Some(inherited) = inherited {
        entries.extend(std::env::split_paths(inherited));
    }
    std::env::join_paths(entries)
        .ok()
        .map(|joined| joined.to_string_lossy().into_owned())
}
