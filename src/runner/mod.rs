//! External process execution
//!
//! Every stage talks to the outside world (git, cmake, ninja, gn, readelf,
//! objdump, tar, the package manager) through the [`CommandRunner`] trait so
//! that the orchestrator can be driven by a scripted runner in tests.

pub mod process;
pub mod scripted;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use process::ProcessRunner;
pub use scripted::ScriptedRunner;

/// Error types for running an external process
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A fully resolved external command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,

    /// Arguments, already rendered
    pub args: Vec<String>,

    /// Working directory (inherits the orchestrator's when unset)
    pub cwd: Option<PathBuf>,

    /// Environment overrides layered over the inherited environment
    pub env: BTreeMap<String, String>,

    /// Wall-clock limit; expiry kills the child
    pub timeout: Option<Duration>,

    /// Stream every output line to this file (appending)
    pub log_file: Option<PathBuf>,

    /// Stop reading and kill the child after this many output lines
    pub line_limit: Option<usize>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn line_limit(mut self, limit: usize) -> Self {
        self.line_limit = Some(limit);
        self
    }

    /// Human-readable command line, used in logs and by the scripted runner
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of an external process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (None when killed by a signal)
    pub exit_code: Option<i32>,

    /// Standard output (only the tail when streamed to a log file)
    pub stdout: String,

    /// Tail of standard error
    pub stderr: String,

    /// Wall-clock duration
    pub duration: Duration,

    /// Output was cut off at the requested line limit
    pub truncated: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// A deliberately truncated run counts as success: the caller asked for
    /// a bounded prefix and got it.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) || self.truncated
    }

    /// The most useful diagnostic text, verbatim
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Last `n` lines of combined output, for failure summaries
    pub fn tail(&self, n: usize) -> String {
        let combined: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .collect();
        let start = combined.len().saturating_sub(n);
        combined[start..].join("\n")
    }
}

/// Trait for running external processes - allows for different implementations
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;
}
