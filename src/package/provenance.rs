//! Provenance manifest written into every bundle

use crate::core::PipelineContext;
use chrono::Utc;

pub const FILE_NAME: &str = "provenance.txt";

/// Ordered `key=value` lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    entries: Vec<(String, String)>,
}

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Snapshot what the run produced so far
    pub fn collect(ctx: &PipelineContext, version: &str) -> Self {
        let mut manifest = Self::new();
        manifest.push("build_timestamp", Utc::now().to_rfc3339());
        manifest.push("run_id", ctx.run_id.to_string());
        manifest.push("pipeline", ctx.config.name.clone());
        manifest.push("version", version);

        match ctx.active_toolchain() {
            Some(toolchain) => {
                let features = toolchain.profile.features();
                manifest.push("toolchain_profile", toolchain.tag());
                manifest.push(
                    "toolchain_features",
                    if features.is_empty() {
                        "none".to_string()
                    } else {
                        features.join(",")
                    },
                );
                manifest.push(
                    "target_isa",
                    toolchain.profile.target_isa.as_deref().unwrap_or("baseline"),
                );
                if let Some(reason) = &toolchain.fallback_reason {
                    manifest.push("toolchain_fallback_reason", single_line(reason));
                }
            }
            None => manifest.push("toolchain_profile", "unbound"),
        }

        for (name, revision) in ctx.revisions() {
            manifest.push(format!("revision.{}", name), revision);
        }

        if let Some(report) = &ctx.evidence {
            manifest.push("verification_score", report.score.to_string());
            manifest.push("verification_rating", report.rating.as_str());
            manifest.push("evidence_model_version", report.model_version.to_string());
        }

        manifest
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
