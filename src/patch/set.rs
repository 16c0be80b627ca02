//! Patch sets and the patch sources they are loaded from

use crate::core::{OptimizationPatchConfig, PipelineError, PrivacyPatchConfig};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One domain-substitution rule
#[derive(Debug, Clone)]
pub struct SubstitutionRule {
    pub pattern: Regex,
    /// Replacement in `regex` syntax (`${1}` for groups)
    pub replacement: String,
}

/// One named source-tree transformation
#[derive(Debug, Clone)]
pub enum PatchOperation {
    /// A unified diff applied with `-p1` semantics
    Diff { name: String, path: PathBuf },
    /// Regex rewrites over a list of files in the target tree
    DomainSubstitution {
        rules: Vec<SubstitutionRule>,
        files: Vec<PathBuf>,
    },
    /// Paths removed from the target tree
    Prune { paths: Vec<PathBuf> },
}

impl PatchOperation {
    pub fn name(&self) -> String {
        match self {
            PatchOperation::Diff { name, .. } => name.clone(),
            PatchOperation::DomainSubstitution { .. } => "domain-substitution".to_string(),
            PatchOperation::Prune { .. } => "pruning".to_string(),
        }
    }
}

/// An ordered, immutable sequence of patch operations
#[derive(Debug, Clone)]
pub struct PatchSet {
    name: String,
    operations: Vec<PatchOperation>,
}

impl PatchSet {
    pub fn new(name: impl Into<String>, operations: Vec<PatchOperation>) -> Self {
        Self {
            name: name.into(),
            operations,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Load the privacy patch collection
    ///
    /// Series directories contribute their diffs in order, followed by one
    /// domain-substitution operation and one pruning operation. Missing
    /// series directories are reported through `warnings`.
    pub fn load_privacy(
        name: &str,
        config: &PrivacyPatchConfig,
        source: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<Self, PipelineError> {
        let invalid = |reason: String| PipelineError::PatchSourceInvalid {
            set: name.to_string(),
            reason,
        };

        if !source.is_dir() {
            return Err(invalid(format!("{} does not exist", source.display())));
        }
        for required in [
            &config.patches_dir,
            &config.domain_substitution_list,
            &config.domain_regex_list,
            &config.pruning_list,
            &config.flags_fragment,
        ] {
            if !source.join(required).exists() {
                return Err(invalid(format!("missing required file {}", required.display())));
            }
        }

        let mut operations = Vec::new();
        for dir in &config.series_dirs {
            let series_dir = source.join(dir);
            if !series_dir.is_dir() {
                warnings.push(format!("{}: series directory {} not found", name, dir.display()));
                continue;
            }
            let series = read_series(&series_dir, warnings).map_err(|e| invalid(e.to_string()))?;
            debug!("{} patches in {}", series.len(), series_dir.display());
            operations.extend(series);
        }

        let rules = read_rules(&source.join(&config.domain_regex_list), warnings)
            .map_err(invalid)?;
        let files = read_list(&source.join(&config.domain_substitution_list))
            .map_err(|e| invalid(e.to_string()))?;
        operations.push(PatchOperation::DomainSubstitution { rules, files });

        let paths = read_list(&source.join(&config.pruning_list)).map_err(|e| invalid(e.to_string()))?;
        operations.push(PatchOperation::Prune { paths });

        Ok(Self::new(name, operations))
    }

    /// Load the optimization patch collection
    ///
    /// Platform directories are visited in order. An ISA-filtered
    /// directory contributes patches naming the target ISA first, then
    /// patches naming no ISA at all; other directories contribute every
    /// patch not matching an exclusion.
    pub fn load_optimization(
        name: &str,
        config: &OptimizationPatchConfig,
        source: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<Self, PipelineError> {
        if !source.is_dir() {
            return Err(PipelineError::PatchSourceInvalid {
                set: name.to_string(),
                reason: format!("{} does not exist", source.display()),
            });
        }

        let isa_tag = config.isa_tag.to_lowercase();
        let isa_family: String = isa_tag.chars().take_while(|c| c.is_ascii_alphabetic()).collect();

        let mut operations = Vec::new();
        for platform in &config.platforms {
            let dir = source.join(&platform.dir);
            if !dir.is_dir() {
                warnings.push(format!("{}: platform directory {} not found", name, platform.dir.display()));
                continue;
            }

            let patches: Vec<PathBuf> = patch_files(&dir)
                .map_err(|e| PipelineError::PatchSourceInvalid {
                    set: name.to_string(),
                    reason: e.to_string(),
                })?
                .into_iter()
                .filter(|p| {
                    let lower = file_name(p).to_lowercase();
                    !platform.exclude.iter().any(|x| lower.contains(&x.to_lowercase()))
                })
                .collect();

            let selected: Vec<PathBuf> = if platform.isa_filtered {
                let (isa, general): (Vec<_>, Vec<_>) = patches
                    .into_iter()
                    .partition(|p| name_tokens(p).iter().any(|t| *t == isa_tag));
                let general = general.into_iter().filter(|p| {
                    isa_family.is_empty() || !name_tokens(p).iter().any(|t| t.starts_with(&isa_family))
                });
                isa.into_iter().chain(general).collect()
            } else {
                patches
            };

            operations.extend(selected.into_iter().map(|path| PatchOperation::Diff {
                name: format!("{}/{}", platform.dir.display(), file_name(&path)),
                path,
            }));
        }

        Ok(Self::new(name, operations))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lowercased `-`/`_`/`.` separated words of a patch file name
fn name_tokens(path: &Path) -> Vec<String> {
    file_name(path)
        .to_lowercase()
        .split(['-', '_', '.'])
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sorted `*.patch` files directly inside `dir`
fn patch_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "patch").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Diffs of one series directory: the `series` file order, or sorted `*.patch`
///
/// Series entries without a patch file are skipped with a warning.
fn read_series(dir: &Path, warnings: &mut Vec<String>) -> std::io::Result<Vec<PatchOperation>> {
    let series_file = dir.join("series");
    let paths = if series_file.is_file() {
        let mut paths = Vec::new();
        for entry in read_list(&series_file)? {
            let path = dir.join(&entry);
            if path.is_file() {
                paths.push(path);
            } else {
                warnings.push(format!(
                    "{}: patch file {} listed in series not found, skipping",
                    file_name(dir),
                    entry.display()
                ));
            }
        }
        paths
    } else {
        patch_files(dir)?
    };

    let series_name = file_name(dir);
    Ok(paths
        .into_iter()
        .map(|path| PatchOperation::Diff {
            name: format!("{}/{}", series_name, file_name(&path)),
            path,
        })
        .collect())
}

/// Non-empty, non-comment lines of a list file
fn read_list(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

/// Parse `pattern@replacement` lines
fn read_rules(path: &Path, warnings: &mut Vec<String>) -> Result<Vec<SubstitutionRule>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;

    let mut rules = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split('@').collect();
        if parts.len() != 2 {
            warnings.push(format!(
                "{}:{}: expected pattern@replacement, skipping",
                path.display(),
                lineno + 1
            ));
            continue;
        }
        let pattern = Regex::new(parts[0])
            .map_err(|e| format!("{}:{}: invalid pattern: {}", path.display(), lineno + 1, e))?;
        rules.push(SubstitutionRule {
            pattern,
            replacement: group_refs(parts[1]),
        });
    }
    Ok(rules)
}

/// Rewrite `\1` style group references as `${1}`, escaping literal `$`
fn group_refs(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' if chars.peek().map(|n| n.is_ascii_digit()).unwrap_or(false) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                out.push_str(&format!("${{{}}}", digits));
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlatformPatchConfig;
    use std::fs;

    fn privacy_source(root: &Path) {
        fs::create_dir_all(root.join("patches/core")).unwrap();
        fs::create_dir_all(root.join("patches/extra")).unwrap();
        fs::write(root.join("patches/core/series"), "# core\n0002-b.patch\n0001-a.patch\n").unwrap();
        fs::write(root.join("patches/core/0002-b.patch"), "").unwrap();
        fs::write(root.join("patches/core/0001-a.patch"), "").unwrap();
        fs::write(root.join("patches/extra/0003-c.patch"), "").unwrap();
        fs::write(root.join("patches/extra/0001-d.patch"), "").unwrap();
        fs::write(root.join("domain_substitution.list"), "chrome/common/url_constants.cc\n").unwrap();
        fs::write(root.join("domain_regex.list"), "google\\.com@9oo91e.qjz9zk\n").unwrap();
        fs::write(root.join("pruning.list"), "third_party/blob.bin\n").unwrap();
        fs::write(root.join("flags.gn"), "enable_reporting=false\n").unwrap();
    }

    #[test]
    fn test_privacy_set_order() {
        let dir = tempfile::tempdir().unwrap();
        privacy_source(dir.path());
        let mut warnings = Vec::new();

        let set = PatchSet::load_privacy("privacy", &PrivacyPatchConfig::default(), dir.path(), &mut warnings)
            .unwrap();
        let names: Vec<String> = set.operations().iter().map(PatchOperation::name).collect();

        assert_eq!(
            names,
            vec![
                "core/0002-b.patch",
                "core/0001-a.patch",
                "extra/0001-d.patch",
                "extra/0003-c.patch",
                "domain-substitution",
                "pruning",
            ]
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("inox-patchset"));
    }

    #[test]
    fn test_missing_series_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        privacy_source(dir.path());
        fs::remove_file(dir.path().join("patches/core/0001-a.patch")).unwrap();
        let mut warnings = Vec::new();

        let set = PatchSet::load_privacy("privacy", &PrivacyPatchConfig::default(), dir.path(), &mut warnings)
            .unwrap();
        let names: Vec<String> = set.operations().iter().map(PatchOperation::name).collect();

        assert_eq!(names[0], "core/0002-b.patch");
        assert_eq!(names[1], "extra/0001-d.patch");
        assert!(warnings
            .iter()
            .any(|w| w.contains("0001-a.patch listed in series not found")));
    }

    #[test]
    fn test_missing_required_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        privacy_source(dir.path());
        fs::remove_file(dir.path().join("pruning.list")).unwrap();

        let err = PatchSet::load_privacy("privacy", &PrivacyPatchConfig::default(), dir.path(), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::PatchSourceInvalid { .. }));
        assert!(err.to_string().contains("pruning.list"));
    }

    #[test]
    fn test_invalid_regex_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        privacy_source(dir.path());
        fs::write(dir.path().join("domain_regex.list"), "(unclosed@x\n").unwrap();

        let err = PatchSet::load_privacy("privacy", &PrivacyPatchConfig::default(), dir.path(), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_optimization_set_selection() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (sub, file) in [
            ("V8", "v8-inline.patch"),
            ("Windows", "general-win.patch"),
            ("Windows", "win-avx2.patch"),
            ("Windows", "win-avx512.patch"),
            ("Linux", "lto-tuning.patch"),
            ("Linux", "gtk-theme.patch"),
            ("Linux", "Wayland-fix.patch"),
        ] {
            fs::create_dir_all(root.join(sub)).unwrap();
            fs::write(root.join(sub).join(file), "").unwrap();
        }

        let set = PatchSet::load_optimization("optimization", &OptimizationPatchConfig::default(), root, &mut Vec::new())
            .unwrap();
        let names: Vec<String> = set.operations().iter().map(PatchOperation::name).collect();

        assert_eq!(
            names,
            vec![
                "V8/v8-inline.patch",
                "Windows/win-avx512.patch",
                "Windows/general-win.patch",
                "Linux/lto-tuning.patch",
            ]
        );
    }

    #[test]
    fn test_bare_isa_tag_selects_one_variant() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Windows")).unwrap();
        for file in ["win-avx.patch", "win-avx2.patch", "win_avx512.patch", "general-win.patch"] {
            fs::write(root.join("Windows").join(file), "").unwrap();
        }
        let config = OptimizationPatchConfig {
            isa_tag: "avx".into(),
            platforms: vec![PlatformPatchConfig {
                dir: PathBuf::from("Windows"),
                isa_filtered: true,
                exclude: vec![],
            }],
            ..OptimizationPatchConfig::default()
        };

        let set = PatchSet::load_optimization("optimization", &config, root, &mut Vec::new()).unwrap();
        let names: Vec<String> = set.operations().iter().map(PatchOperation::name).collect();

        assert_eq!(names, vec!["Windows/win-avx.patch", "Windows/general-win.patch"]);
    }

    #[test]
    fn test_missing_platform_dir_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let config = OptimizationPatchConfig {
            resource: "chromium-clang".into(),
            isa_tag: "avx2".into(),
            platforms: vec![PlatformPatchConfig {
                dir: PathBuf::from("Mac"),
                isa_filtered: false,
                exclude: vec![],
            }],
            markers: vec![],
        };
        let mut warnings = Vec::new();

        let set = PatchSet::load_optimization("optimization", &config, dir.path(), &mut warnings).unwrap();
        assert!(set.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_group_refs() {
        assert_eq!(group_refs("\\1.example"), "${1}.example");
        assert_eq!(group_refs("cost$5"), "cost$$5");
        assert_eq!(group_refs("plain"), "plain");
    }
}
