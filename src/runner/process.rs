//! Process runner backed by `tokio::process`

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Lines of output kept in memory when a command streams to a log file
const DEFAULT_TAIL_LINES: usize = 200;

/// Runs commands as real child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tail_lines: usize,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Keep at most `lines` lines of output in memory for streamed commands
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines.max(1);
        self
    }

    async fn drive(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let program = spec.program.clone();
        let io_err = |source| RunnerError::Io {
            program: program.clone(),
            source,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut log = match &spec.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
                }
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(io_err)?;
                let mut writer = BufWriter::new(file);
                let header = format!("$ {}\n", spec.command_line());
                writer.write_all(header.as_bytes()).await.map_err(io_err)?;
                Some(writer)
            }
            None => None,
        };

        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);
        let mut out_buf = LineBuffer::new(if log.is_some() {
            Some(self.tail_lines)
        } else {
            None
        });
        let mut err_buf = LineBuffer::new(Some(self.tail_lines));
        let mut seen = 0usize;
        let mut truncated = false;

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => {
                    match line.map_err(io_err)? {
                        Some(line) => {
                            if let Some(writer) = log.as_mut() {
                                writer.write_all(line.as_bytes()).await.map_err(io_err)?;
                                writer.write_all(b"\n").await.map_err(io_err)?;
                            }
                            out_buf.push(line);
                            seen += 1;
                        }
                        None => stdout = None,
                    }
                }
                line = next_line(&mut stderr), if stderr.is_some() => {
                    match line.map_err(io_err)? {
                        Some(line) => {
                            if let Some(writer) = log.as_mut() {
                                writer.write_all(line.as_bytes()).await.map_err(io_err)?;
                                writer.write_all(b"\n").await.map_err(io_err)?;
                            }
                            err_buf.push(line);
                        }
                        None => stderr = None,
                    }
                }
            }

            if let Some(limit) = spec.line_limit {
                if seen >= limit {
                    truncated = true;
                    break;
                }
            }
        }

        if truncated {
            debug!("{}: line limit reached, stopping child", spec.program);
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop {}: {}", spec.program, e);
            }
        }

        let status = child.wait().await.map_err(io_err)?;
        if let Some(mut writer) = log {
            writer.flush().await.map_err(io_err)?;
        }

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: out_buf.join(),
            stderr: err_buf.join(),
            duration: start.elapsed(),
            truncated,
        })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        debug!("Running: {}", spec.command_line());

        let output = match spec.timeout {
            Some(limit) => timeout(limit, self.drive(spec))
                .await
                .map_err(|_| RunnerError::Timeout {
                    program: spec.program.clone(),
                    secs: limit.as_secs(),
                })??,
            None => self.drive(spec).await?,
        };

        if !output.success() {
            debug!(
                "{} exited with {:?}: {}",
                spec.program,
                output.exit_code,
                output.stderr.lines().last().unwrap_or_default()
            );
        }

        Ok(output)
    }
}

/// Read one line, tolerating invalid UTF-8 in tool output
async fn next_line<R>(reader: &mut Option<R>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(reader) = reader.as_mut() else {
        return Ok(None);
    };

    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Either keeps every line or a bounded tail
struct LineBuffer {
    cap: Option<usize>,
    lines: VecDeque<String>,
}

impl LineBuffer {
    fn new(cap: Option<usize>) -> Self {
        Self {
            cap,
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, line: String) {
        if let Some(cap) = self.cap {
            if self.lines.len() == cap {
                self.lines.pop_front();
            }
        }
        self.lines.push_back(line);
    }

    fn join(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_line_buffer_keeps_tail() {
        let mut buf = LineBuffer::new(Some(2));
        for line in ["one", "two", "three"] {
            buf.push(line.to_string());
        }
        assert_eq!(buf.join(), "two\nthree");
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);

        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_streams_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("build.log");
        let runner = ProcessRunner::new().with_tail_lines(1);
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo first; echo second"])
            .log_to(&log);

        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "second");

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }

    #[tokio::test]
    async fn test_line_limit_truncates() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "i=0; while true; do echo line$i; i=$((i+1)); done"])
            .line_limit(5);

        let output = runner.run(&spec).await.unwrap();
        assert!(output.truncated);
        assert!(output.success());
        assert_eq!(output.stdout.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("10")
            .timeout(Some(Duration::from_millis(100)));

        let result = runner.run(&spec).await;
        assert!(matches!(result, Err(RunnerError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("nonexistent-ultibuild-binary");
        let result = runner.run(&spec).await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
