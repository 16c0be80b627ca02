//! Command-line interface

pub mod commands;
pub mod output;

use crate::execution::RunOptions;
use clap::{Parser, Subcommand};
use commands::HistoryCommand;
use std::ffi::OsString;
use std::path::PathBuf;

/// Optimized, privacy-patched browser build orchestrator
#[derive(Debug, Parser, Clone)]
#[command(name = "ultibuild")]
#[command(version)]
#[command(about = "Builds an optimized, privacy-patched Chromium and verifies which optimizations landed", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to build configuration file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the root working directory
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Wipe the root directory before building
    #[arg(long)]
    pub clean: bool,

    /// Skip the host tool check
    #[arg(long)]
    pub skip_deps: bool,

    /// Print the stage plan without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show previous runs
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            clean: self.clean,
            skip_deps: self.skip_deps,
            dry_run: self.dry_run,
        }
    }
}
