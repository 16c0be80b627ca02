//! Versioned evidence model: category -> indicators -> weight

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const BUILTIN: &str = include_str!("default_model.yaml");

/// Fact source a probe reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    Sections,
    Notes,
    Comment,
    Symbols,
    DynamicSymbols,
    Disassembly,
}

impl FactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactSource::Sections => "section headers",
            FactSource::Notes => "ELF notes",
            FactSource::Comment => ".comment strings",
            FactSource::Symbols => "symbol table",
            FactSource::DynamicSymbols => "dynamic symbol table",
            FactSource::Disassembly => "disassembly sample",
        }
    }
}

/// What an indicator looks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Probe {
    /// A section named exactly `name` or `name.*`
    Section { name: String },
    /// Text in the ELF notes
    Note { contains: String },
    /// Text in the `.comment` string table
    Comment { contains: String },
    /// A symbol name containing `contains`
    Symbol { contains: String },
    /// Sampled instructions whose mnemonic starts with `prefix`
    Mnemonic {
        prefix: String,
        #[serde(default = "one")]
        min_count: usize,
    },
    /// Sampled instructions whose operands contain `contains`
    Operand {
        contains: String,
        #[serde(default = "one")]
        min_count: usize,
    },
    /// Fewer exported dynamic symbols than `max`
    DynamicSymbolsBelow { max: usize },
}

fn one() -> usize {
    1
}

fn default_weight() -> u32 {
    1
}

impl Probe {
    pub fn source(&self) -> FactSource {
        match self {
            Probe::Section { .. } => FactSource::Sections,
            Probe::Note { .. } => FactSource::Notes,
            Probe::Comment { .. } => FactSource::Comment,
            Probe::Symbol { .. } => FactSource::Symbols,
            Probe::Mnemonic { .. } | Probe::Operand { .. } => FactSource::Disassembly,
            Probe::DynamicSymbolsBelow { .. } => FactSource::DynamicSymbols,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub probe: Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub label: String,
    pub indicators: Vec<Indicator>,
}

/// The full evidence model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceModel {
    pub version: u32,
    pub categories: Vec<Category>,
}

impl EvidenceModel {
    /// The model compiled into the crate
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let model: EvidenceModel = serde_yaml::from_str(yaml)?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            anyhow::bail!("Evidence model has no categories");
        }
        let mut seen = HashSet::new();
        for category in &self.categories {
            if !seen.insert(category.id.as_str()) {
                anyhow::bail!("Duplicate evidence category: {}", category.id);
            }
            if category.indicators.is_empty() {
                anyhow::bail!("Evidence category '{}' has no indicators", category.id);
            }
            if let Some(indicator) = category.indicators.iter().find(|i| i.weight == 0) {
                anyhow::bail!(
                    "Indicator '{}' in category '{}' has zero weight",
                    indicator.name,
                    category.id
                );
            }
        }
        Ok(())
    }

    /// Sources any indicator reads
    pub fn sources(&self) -> HashSet<FactSource> {
        self.categories
            .iter()
            .flat_map(|c| c.indicators.iter().map(|i| i.probe.source()))
            .collect()
    }
}
