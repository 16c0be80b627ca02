//! Scripted runner for tests and rehearsals
//!
//! Matches command lines against scripted rules, optionally performs a side
//! effect (creating the directory a clone would create, writing the binary a
//! build would produce) and records every invocation.

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};
use async_trait::async_trait;
use std::sync::Mutex;

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, RunnerError> + Send + Sync>;

struct Rule {
    matcher: Matcher,
    responder: Responder,
}

/// Command runner that replays scripted responses
///
/// Rules added later take precedence over earlier ones, so a test can start
/// from a runner scripted for the happy path and override a single command.
/// Unmatched commands succeed with empty output.
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Add a rule with a custom matcher and responder
    pub fn on<M, R>(mut self, matcher: M, responder: R) -> Self
    where
        M: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        R: Fn(&CommandSpec) -> Result<CommandOutput, RunnerError> + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            matcher: Box::new(matcher),
            responder: Box::new(responder),
        });
        self
    }

    /// Respond with `output` whenever the command line contains `needle`
    pub fn respond(self, needle: &str, output: CommandOutput) -> Self {
        let needle = needle.to_string();
        self.on(
            move |spec| spec.command_line().contains(&needle),
            move |_| Ok(output.clone()),
        )
    }

    /// Fail with `exit_code` and `stderr` whenever the command line contains `needle`
    pub fn fail(self, needle: &str, exit_code: i32, stderr: &str) -> Self {
        self.respond(needle, CommandOutput::failed(exit_code, stderr))
    }

    /// Every command seen so far, in order
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Every command line seen so far, in order
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::command_line).collect()
    }

    /// Number of recorded command lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }

        match self.rules.iter().rev().find(|rule| (rule.matcher)(spec)) {
            Some(rule) => (rule.responder)(spec),
            None => Ok(CommandOutput::ok("")),
        }
    }
}
