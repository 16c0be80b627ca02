//! Binary inspection through readelf, nm and objdump

use crate::core::VerifyConfig;
use crate::runner::{CommandRunner, CommandSpec};
use crate::verify::FactSource;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// One sampled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: String,
    pub operands: String,
}

/// Everything the probes can look at
#[derive(Debug, Clone, Default)]
pub struct BinaryFacts {
    pub sections: BTreeSet<String>,
    pub notes: String,
    pub comment: String,
    pub symbols: Vec<String>,
    pub dynamic_symbol_count: Option<usize>,
    pub instructions: Vec<Instruction>,

    /// Sources whose tool failed, with the reason
    pub unavailable: BTreeMap<FactSource, String>,
}

impl BinaryFacts {
    pub fn is_available(&self, source: FactSource) -> bool {
        !self.unavailable.contains_key(&source)
    }
}

/// Gathers [`BinaryFacts`] for the sources a model needs
pub struct BinaryInspector {
    runner: Arc<dyn CommandRunner>,
    config: VerifyConfig,
}

impl BinaryInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, config: VerifyConfig) -> Self {
        Self { runner, config }
    }

    pub async fn inspect(&self, binary: &Path, sources: &HashSet<FactSource>) -> BinaryFacts {
        let mut facts = BinaryFacts::default();

        let mut wanted: Vec<FactSource> = sources.iter().copied().collect();
        wanted.sort();
        for source in wanted {
            let cmd = self.command(source, binary);
            let output = match self.runner.run(&cmd).await {
                Ok(output) if output.success() => output,
                Ok(output) => {
                    self.mark_unavailable(&mut facts, source, output.diagnostic());
                    continue;
                }
                Err(e) => {
                    self.mark_unavailable(&mut facts, source, e.to_string());
                    continue;
                }
            };

            let text = output.stdout;
            match source {
                FactSource::Sections => facts.sections = parse_sections(&text),
                FactSource::Notes => facts.notes = text,
                FactSource::Comment => facts.comment = text,
                FactSource::Symbols => facts.symbols = parse_symbols(&text),
                FactSource::DynamicSymbols => {
                    facts.dynamic_symbol_count = Some(parse_symbols(&text).len())
                }
                FactSource::Disassembly => {
                    facts.instructions = parse_instructions(&text);
                    facts.instructions.truncate(self.config.instruction_ceiling);
                    debug!("sampled {} instructions", facts.instructions.len());
                }
            }
        }

        facts
    }

    fn command(&self, source: FactSource, binary: &Path) -> CommandSpec {
        let config = &self.config;
        let cmd = match source {
            FactSource::Sections => CommandSpec::new(config.readelf.clone()).arg("-SW"),
            FactSource::Notes => CommandSpec::new(config.readelf.clone()).arg("-n"),
            FactSource::Comment => CommandSpec::new(config.readelf.clone()).args(["-p", ".comment"]),
            FactSource::Symbols => CommandSpec::new(config.nm.clone())
                .arg("--no-demangle")
                .line_limit(config.symbol_sample_limit),
            FactSource::DynamicSymbols => {
                CommandSpec::new(config.nm.clone()).args(["-D", "--defined-only", "--no-demangle"])
            }
            FactSource::Disassembly => CommandSpec::new(config.objdump.clone())
                .args(["-d", "--no-show-raw-insn"])
                .line_limit(config.instruction_ceiling),
        };
        cmd.path_arg(binary)
    }

    fn mark_unavailable(&self, facts: &mut BinaryFacts, source: FactSource, reason: String) {
        warn!("{} unavailable: {}", source.as_str(), reason);
        facts.unavailable.insert(source, reason);
    }
}

/// Section names from `readelf -SW`, skipping the null section
fn parse_sections(text: &str) -> BTreeSet<String> {
    static SECTION: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = SECTION
        .get_or_init(|| Regex::new(r"^\s*\[\s*(\d+)\]\s+(\S+)").ok())
        .as_ref()
    else {
        return BTreeSet::new();
    };

    text.lines()
        .filter_map(|line| re.captures(line))
        .filter(|caps| &caps[1] != "0")
        .map(|caps| caps[2].to_string())
        .collect()
}

/// Symbol names from `nm` output (last column)
fn parse_symbols(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.ends_with(':'))
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Instructions from `objdump -d --no-show-raw-insn`
fn parse_instructions(text: &str) -> Vec<Instruction> {
    static INSN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = INSN
        .get_or_init(|| Regex::new(r"^\s*[0-9a-f]+:\s+(\S+)\s*(.*)$").ok())
        .as_ref()
    else {
        return Vec::new();
    };

    text.lines()
        .filter_map(|line| re.captures(line))
        .map(|caps| Instruction {
            mnemonic: caps[1].to_string(),
            operands: caps[2].trim().to_string(),
        })
        .collect()
}
