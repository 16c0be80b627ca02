//! Evidence scoring

use crate::verify::{BinaryFacts, EvidenceModel, FactSource, Probe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorEvidence {
    pub name: String,
    pub found: bool,
    pub weight: u32,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEvidence {
    pub id: String,
    pub label: String,
    pub indicators: Vec<IndicatorEvidence>,

    /// Weighted share of found indicators, as a whole percentage
    pub score: u32,
}

impl CategoryEvidence {
    pub fn found(&self) -> usize {
        self.indicators.iter().filter(|i| i.found).count()
    }
}

/// Overall classification of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rating {
    Excellent,
    Good,
    Limited,
}

impl Rating {
    /// Strictly above `excellent` is excellent, strictly above `good` is good
    pub fn classify(score: u32, excellent: u32, good: u32) -> Self {
        if score > excellent {
            Rating::Excellent
        } else if score > good {
            Rating::Good
        } else {
            Rating::Limited
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Excellent => "excellent",
            Rating::Good => "good",
            Rating::Limited => "limited",
        }
    }
}

/// Heuristic evidence for each optimization category
///
/// Written once after verification and never changed. A missing indicator
/// is weak evidence: it does not prove the optimization is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceReport {
    pub model_version: u32,
    pub binary: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub categories: Vec<CategoryEvidence>,

    /// Mean of the category scores
    pub score: u32,
    pub rating: Rating,

    /// Fact sources that could not be read; their indicators count as not found
    pub inconclusive: Vec<String>,

    pub instructions_sampled: usize,
}

impl EvidenceReport {
    /// Score `facts` against `model`
    pub fn evaluate(
        model: &EvidenceModel,
        facts: &BinaryFacts,
        binary: PathBuf,
        excellent: u32,
        good: u32,
    ) -> Self {
        let categories: Vec<CategoryEvidence> = model
            .categories
            .iter()
            .map(|category| {
                let indicators: Vec<IndicatorEvidence> = category
                    .indicators
                    .iter()
                    .map(|indicator| {
                        let (found, detail) = check(&indicator.probe, facts);
                        IndicatorEvidence {
                            name: indicator.name.clone(),
                            found,
                            weight: indicator.weight,
                            detail,
                        }
                    })
                    .collect();
                let score = percentage(
                    indicators.iter().filter(|i| i.found).map(|i| i.weight).sum(),
                    indicators.iter().map(|i| i.weight).sum(),
                );
                CategoryEvidence {
                    id: category.id.clone(),
                    label: category.label.clone(),
                    indicators,
                    score,
                }
            })
            .collect();

        let score = if categories.is_empty() {
            0
        } else {
            let total: u32 = categories.iter().map(|c| c.score).sum();
            (total as f64 / categories.len() as f64).round() as u32
        };

        Self {
            model_version: model.version,
            binary,
            generated_at: Utc::now(),
            categories,
            score,
            rating: Rating::classify(score, excellent, good),
            inconclusive: facts
                .unavailable
                .iter()
                .map(|(source, reason)| format!("{}: {}", source.as_str(), reason))
                .collect(),
            instructions_sampled: facts.instructions.len(),
        }
    }

    pub fn category(&self, id: &str) -> Option<&CategoryEvidence> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Plain-text rendering for the consolidated report
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Optimization evidence for {} (model v{})",
            self.binary.display(),
            self.model_version
        );
        for category in &self.categories {
            let _ = writeln!(
                out,
                "  {:<45} {:>3}%  ({}/{})",
                category.label,
                category.score,
                category.found(),
                category.indicators.len()
            );
            for indicator in &category.indicators {
                let _ = writeln!(
                    out,
                    "    [{}] {} - {}",
                    if indicator.found { "x" } else { " " },
                    indicator.name,
                    indicator.detail
                );
            }
        }
        let _ = writeln!(out, "  Overall: {}% ({})", self.score, self.rating.as_str());
        let _ = writeln!(out, "  Instructions sampled: {}", self.instructions_sampled);
        for note in &self.inconclusive {
            let _ = writeln!(out, "  Inconclusive: {}", note);
        }
        out
    }
}

fn percentage(found: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (100.0 * found as f64 / total as f64).round() as u32
}

fn check(probe: &Probe, facts: &BinaryFacts) -> (bool, String) {
    let source = probe.source();
    if !facts.is_available(source) {
        return (false, format!("{} unavailable", source.as_str()));
    }

    match probe {
        Probe::Section { name } => {
            let dotted = format!("{}.", name);
            match facts
                .sections
                .iter()
                .find(|s| *s == name || s.starts_with(&dotted))
            {
                Some(section) => (true, format!("section {}", section)),
                None => (false, format!("no {} section", name)),
            }
        }
        Probe::Note { contains } => text_check(&facts.notes, contains, "notes"),
        Probe::Comment { contains } => text_check(&facts.comment, contains, ".comment"),
        Probe::Symbol { contains } => {
            let count = facts.symbols.iter().filter(|s| s.contains(contains.as_str())).count();
            (count > 0, format!("{} symbols containing {}", count, contains))
        }
        Probe::Mnemonic { prefix, min_count } => {
            let count = facts
                .instructions
                .iter()
                .filter(|i| i.mnemonic.starts_with(prefix.as_str()))
                .count();
            (
                count >= *min_count,
                format!("{} {}* of {} sampled", count, prefix, facts.instructions.len()),
            )
        }
        Probe::Operand { contains, min_count } => {
            let count = facts
                .instructions
                .iter()
                .filter(|i| i.operands.contains(contains.as_str()))
                .count();
            (
                count >= *min_count,
                format!("{} with {} of {} sampled", count, contains, facts.instructions.len()),
            )
        }
        Probe::DynamicSymbolsBelow { max } => match facts.dynamic_symbol_count {
            Some(count) => (count < *max, format!("{} dynamic symbols (threshold {})", count, max)),
            None => (false, format!("{} unavailable", FactSource::DynamicSymbols.as_str())),
        },
    }
}

fn text_check(haystack: &str, needle: &str, what: &str) -> (bool, String) {
    if haystack.contains(needle) {
        (true, format!("{} mention {}", what, needle))
    } else {
        (false, format!("{} do not mention {}", what, needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{Category, Indicator, Instruction};

    fn comment_indicator(marker: &str) -> Indicator {
        Indicator {
            name: marker.to_string(),
            weight: 1,
            probe: Probe::Comment {
                contains: marker.to_string(),
            },
        }
    }

    fn model() -> EvidenceModel {
        EvidenceModel {
            version: 1,
            categories: vec![
                Category {
                    id: "first".into(),
                    label: "First".into(),
                    indicators: ["A", "B", "C", "D", "E"].iter().map(|m| comment_indicator(m)).collect(),
                },
                Category {
                    id: "second".into(),
                    label: "Second".into(),
                    indicators: ["W", "X", "Y", "Z"].iter().map(|m| comment_indicator(m)).collect(),
                },
            ],
        }
    }

    #[test]
    fn test_scores_are_per_category_means() {
        let facts = BinaryFacts {
            comment: "A B C".to_string(),
            ..BinaryFacts::default()
        };

        let report = EvidenceReport::evaluate(&model(), &facts, PathBuf::from("chrome"), 70, 50);

        assert_eq!(report.category("first").unwrap().score, 60);
        assert_eq!(report.category("second").unwrap().score, 0);
        // Mean of 60 and 0, not 3 of 9 indicators.
        assert_eq!(report.score, 30);
        assert_eq!(report.rating, Rating::Limited);
    }

    #[test]
    fn test_rating_thresholds_are_strict() {
        assert_eq!(Rating::classify(71, 70, 50), Rating::Excellent);
        assert_eq!(Rating::classify(70, 70, 50), Rating::Good);
        assert_eq!(Rating::classify(51, 70, 50), Rating::Good);
        assert_eq!(Rating::classify(50, 70, 50), Rating::Limited);
    }

    #[test]
    fn test_unavailable_source_counts_as_not_found() {
        let mut facts = BinaryFacts {
            comment: "A B C D E W X Y Z".to_string(),
            ..BinaryFacts::default()
        };
        facts
            .unavailable
            .insert(FactSource::Comment, "readelf missing".to_string());

        let report = EvidenceReport::evaluate(&model(), &facts, PathBuf::from("chrome"), 70, 50);
        assert_eq!(report.score, 0);
        assert_eq!(report.inconclusive.len(), 1);
    }

    #[test]
    fn test_builtin_model_on_optimized_facts() {
        let model = EvidenceModel::builtin().unwrap();
        let facts = BinaryFacts {
            sections: [".text.hot", ".text.unlikely", ".text", ".note.bolt_info", ".bolt.org.text"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            notes: "x86 ISA needed: x86-64-baseline, x86-64-v4".to_string(),
            comment: "Linker: LLD 18.1.0\nclang version 18.1.0\nBOLT revision abc".to_string(),
            symbols: vec!["foo.llvm.1234".into(), "bar.cold".into()],
            dynamic_symbol_count: Some(300),
            instructions: vec![
                Instruction {
                    mnemonic: "vfmadd231ps".into(),
                    operands: "%zmm1,%zmm2,%zmm0".into(),
                },
                Instruction {
                    mnemonic: "kmovw".into(),
                    operands: "%k1,%eax".into(),
                },
                Instruction {
                    mnemonic: "vmovaps".into(),
                    operands: "%ymm0,(%rdi)".into(),
                },
            ],
            unavailable: Default::default(),
        };

        let report = EvidenceReport::evaluate(&model, &facts, PathBuf::from("chrome"), 70, 50);
        assert!(report.categories.iter().all(|c| c.score == 100));
        assert_eq!(report.rating, Rating::Excellent);
        assert!(report.render_text().contains("Overall: 100% (excellent)"));
    }
}
