//! Build configuration from YAML

use crate::runner::CommandSpec;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level build configuration loaded from YAML
///
/// Every section has a default, so an empty document (or no document at
/// all) describes a complete Chromium build with the ungoogled privacy
/// patches, the clang optimization patches and a custom LLVM toolchain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Name used in reports and run history
    pub name: String,

    /// Root of the working directory tree
    pub root_dir: PathBuf,

    /// External resources synced before anything else
    pub resources: Vec<ResourceConfig>,

    /// Extra environment overrides for every external command
    pub environment: BTreeMap<String, String>,

    /// Directories prepended to PATH, relative to the root
    pub search_path: Vec<PathBuf>,

    /// Host tool pre-flight check
    pub dependencies: DependencyConfig,

    /// Upper bound for a single clone or fetch
    pub fetch_timeout_secs: u64,

    pub toolchain: ToolchainConfig,
    pub patches: PatchesConfig,
    pub build: CompileConfig,
    pub verify: VerifyConfig,
    pub package: PackageConfig,
}

/// One external resource (a git repository)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub url: String,

    /// Checkout location, relative to the root
    pub path: PathBuf,

    /// File whose first line names the revision to check out, relative to the root
    #[serde(default)]
    pub pin_file: Option<PathBuf>,

    /// Branch to clone when no pin applies
    #[serde(default)]
    pub branch: Option<String>,
}

impl ResourceConfig {
    fn new(name: &str, url: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            path: PathBuf::from(path),
            pin_file: None,
            branch: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Tools that must resolve on PATH
    pub required_tools: Vec<String>,

    /// Run once when tools are missing, then re-check
    pub install_script: Option<CommandTemplate>,
}

/// Custom toolchain build and its system fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub source: ResourceConfig,

    /// Out-of-tree build directory, relative to the root
    pub build_dir: PathBuf,

    /// Install prefix of the custom toolchain, relative to the root
    pub install_dir: PathBuf,

    /// Memory floor below which no toolchain build is attempted
    pub min_memory_gb: u64,

    /// `-march` value for the custom toolchain profile
    pub target_isa: String,

    /// Merged `.profdata` passed as `-fprofile-use`, relative to the root
    pub pgo_profile: Option<PathBuf>,

    pub configure: CommandTemplate,
    pub compile: CommandTemplate,
    pub install: CommandTemplate,

    /// Installs the baseline system compiler
    pub fallback_install: CommandTemplate,

    /// Prefix the system compiler lives under
    pub fallback_prefix: PathBuf,

    pub build_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchesConfig {
    pub privacy: PrivacyPatchConfig,
    pub optimization: OptimizationPatchConfig,
}

/// Layout of the privacy patch collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyPatchConfig {
    /// Resource holding the collection
    pub resource: String,

    /// Patch directory, relative to the resource
    pub patches_dir: PathBuf,

    /// Series directories in application order, relative to the resource
    pub series_dirs: Vec<PathBuf>,

    pub domain_substitution_list: PathBuf,
    pub domain_regex_list: PathBuf,
    pub pruning_list: PathBuf,

    /// GN fragment merged into the build arguments
    pub flags_fragment: PathBuf,

    /// Strings the patched tree should contain afterwards
    pub markers: Vec<PatchMarker>,
}

/// Layout of the optimization patch collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationPatchConfig {
    pub resource: String,

    /// ISA tag matched against whole words of patch file names (`avx512` selects `win-avx512.patch`)
    pub isa_tag: String,

    /// Platform directories in application order
    pub platforms: Vec<PlatformPatchConfig>,

    pub markers: Vec<PatchMarker>,
}

/// Text expected in a patched file once its set has been applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMarker {
    /// File relative to the source tree
    pub file: PathBuf,

    /// Matched case-insensitively
    pub contains: String,
}

impl PatchMarker {
    pub fn new(file: impl Into<PathBuf>, contains: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            contains: contains.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformPatchConfig {
    /// Directory relative to the resource
    pub dir: PathBuf,

    /// Apply ISA-specific patches first and skip other ISA variants
    #[serde(default)]
    pub isa_filtered: bool,

    /// Case-insensitive name fragments that exclude a patch
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Target build system invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Resource whose checkout is the source tree
    pub source_resource: String,

    /// Output directory, relative to the source tree
    pub out_dir: PathBuf,

    /// Static optimization-flag manifest, relative to the root
    pub flags_manifest: PathBuf,

    pub gen: CommandTemplate,
    pub list_args: CommandTemplate,
    pub build: CommandTemplate,

    /// Artifacts requested from the build tool
    pub targets: Vec<String>,

    /// Parallelism override; CPU count when unset
    pub jobs: Option<usize>,

    pub timeout_secs: Option<u64>,
}

/// Heuristic verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Binary to inspect, relative to the output directory
    pub binary: PathBuf,

    /// Score above which a run is rated excellent
    pub excellent_threshold: u32,

    /// Score above which a run is rated good
    pub good_threshold: u32,

    /// Disassembly lines sampled at most
    pub instruction_ceiling: usize,

    /// Symbol table lines read at most
    pub symbol_sample_limit: usize,

    /// Evidence model overriding the built-in one
    pub model_file: Option<PathBuf>,

    pub readelf: String,
    pub nm: String,
    pub objdump: String,
}

/// Bundle layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Required artifact, relative to the output directory
    pub primary_artifact: PathBuf,

    /// Copied when present
    pub optional_artifacts: Vec<PathBuf>,

    /// Directories copied when present
    pub resource_dirs: Vec<PathBuf>,

    /// Bundle directory prefix
    pub bundle_prefix: String,

    /// Version string; read from the pin file of the source resource when unset
    pub version: Option<String>,

    pub archive: CommandTemplate,
}

/// An external command line with `{{ name }}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Values substituted into a [`CommandTemplate`]
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.scalars.insert(key.to_string(), value.into());
        self
    }

    pub fn set_path(self, key: &str, path: &Path) -> Self {
        self.set(key, path.to_string_lossy().into_owned())
    }

    /// A list expands into several arguments when an argument is exactly its placeholder
    pub fn set_list(mut self, key: &str, values: Vec<String>) -> Self {
        self.scalars.insert(key.to_string(), values.join(" "));
        self.lists.insert(key.to_string(), values);
        self
    }

    /// Substitute placeholders in one left-to-right pass
    ///
    /// Substituted values are never rescanned; unknown placeholders are
    /// kept verbatim.
    fn render_str(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{ ") {
            rendered.push_str(&rest[..start]);
            let after_open = &rest[start + 3..];
            let Some(end) = after_open.find(" }}") else {
                rest = &rest[start..];
                break;
            };
            let key = &after_open[..end];
            match self.scalars.get(key) {
                Some(value) => rendered.push_str(value),
                None => rendered.push_str(&rest[start..start + 3 + end + 3]),
            }
            rest = &after_open[end + 3..];
        }
        rendered.push_str(rest);
        rendered
    }
}

impl CommandTemplate {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Render into a runnable command
    pub fn render(&self, vars: &TemplateVars) -> CommandSpec {
        let mut spec = CommandSpec::new(vars.render_str(&self.program));
        for arg in &self.args {
            let list = arg
                .trim()
                .strip_prefix("{{ ")
                .and_then(|rest| rest.strip_suffix(" }}"))
                .and_then(|key| vars.lists.get(key));
            spec = match list {
                Some(values) => spec.args(values.iter().cloned()),
                None => spec.arg(vars.render_str(arg)),
            };
        }
        spec
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        let mut chromium = ResourceConfig::new(
            "chromium",
            "https://chromium.googlesource.com/chromium/src.git",
            "chromium/src",
        );
        chromium.pin_file = Some(PathBuf::from(
            "patches/ungoogled-chromium/chromium_version.txt",
        ));

        Self {
            name: "ultimate-chromium".to_string(),
            root_dir: PathBuf::from("build"),
            resources: vec![
                ResourceConfig::new(
                    "ungoogled-chromium",
                    "https://github.com/ungoogled-software/ungoogled-chromium.git",
                    "patches/ungoogled-chromium",
                ),
                ResourceConfig::new(
                    "chromium-clang",
                    "https://github.com/RobRich999/Chromium_Clang.git",
                    "patches/chromium-clang",
                ),
                chromium,
            ],
            environment: BTreeMap::new(),
            search_path: vec![PathBuf::from("depot_tools")],
            dependencies: DependencyConfig::default(),
            fetch_timeout_secs: 3600,
            toolchain: ToolchainConfig::default(),
            patches: PatchesConfig::default(),
            build: CompileConfig::default(),
            verify: VerifyConfig::default(),
            package: PackageConfig::default(),
        }
    }
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            required_tools: ["git", "python3", "cmake", "ninja", "gn", "readelf", "nm", "objdump", "tar"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            install_script: None,
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            source: ResourceConfig::new(
                "llvm-project",
                "https://github.com/llvm/llvm-project.git",
                "toolchain/llvm-project",
            ),
            build_dir: PathBuf::from("toolchain/build"),
            install_dir: PathBuf::from("toolchain/install"),
            min_memory_gb: 4,
            target_isa: "skylake-avx512".to_string(),
            pgo_profile: None,
            configure: CommandTemplate::new(
                "cmake",
                [
                    "-G",
                    "Ninja",
                    "-S",
                    "{{ source_dir }}/llvm",
                    "-B",
                    "{{ build_dir }}",
                    "-DCMAKE_BUILD_TYPE=Release",
                    "-DCMAKE_INSTALL_PREFIX={{ install_dir }}",
                    "-DLLVM_ENABLE_PROJECTS=clang;lld;polly;bolt",
                    "-DLLVM_TARGETS_TO_BUILD=X86",
                    "-DLLVM_ENABLE_LTO=Thin",
                    "-DLLVM_BUILD_INSTRUMENTED=IR",
                    "-DLLVM_POLLY_LINK_INTO_TOOLS=ON",
                    "-DCMAKE_C_FLAGS=-march={{ target_isa }}",
                    "-DCMAKE_CXX_FLAGS=-march={{ target_isa }}",
                ],
            ),
            compile: CommandTemplate::new("ninja", ["-C", "{{ build_dir }}", "-j", "{{ jobs }}"]),
            install: CommandTemplate::new("ninja", ["-C", "{{ build_dir }}", "install"]),
            fallback_install: CommandTemplate::new(
                "sudo",
                ["apt-get", "install", "-y", "clang", "lld", "llvm"],
            ),
            fallback_prefix: PathBuf::from("/usr"),
            build_timeout_secs: None,
        }
    }
}

impl Default for PrivacyPatchConfig {
    fn default() -> Self {
        Self {
            resource: "ungoogled-chromium".to_string(),
            patches_dir: PathBuf::from("patches"),
            series_dirs: vec![
                PathBuf::from("patches/core"),
                PathBuf::from("patches/extra"),
                PathBuf::from("patches/inox-patchset"),
            ],
            domain_substitution_list: PathBuf::from("domain_substitution.list"),
            domain_regex_list: PathBuf::from("domain_regex.list"),
            pruning_list: PathBuf::from("pruning.list"),
            flags_fragment: PathBuf::from("flags.gn"),
            markers: vec![
                PatchMarker::new("chrome/browser/chrome_browser_main.cc", "ungoogled-chromium"),
                PatchMarker::new("chrome/browser/about_flags.cc", "ungoogled-chromium"),
            ],
        }
    }
}

impl Default for OptimizationPatchConfig {
    fn default() -> Self {
        Self {
            resource: "chromium-clang".to_string(),
            isa_tag: "avx512".to_string(),
            platforms: vec![
                PlatformPatchConfig {
                    dir: PathBuf::from("V8"),
                    isa_filtered: false,
                    exclude: Vec::new(),
                },
                PlatformPatchConfig {
                    dir: PathBuf::from("Windows"),
                    isa_filtered: true,
                    exclude: Vec::new(),
                },
                PlatformPatchConfig {
                    dir: PathBuf::from("Linux"),
                    isa_filtered: false,
                    exclude: ["alsa", "gtk", "x11", "wayland"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                },
            ],
            markers: vec![
                PatchMarker::new("build/config/compiler/BUILD.gn", "-O3"),
                PatchMarker::new("build/config/compiler/BUILD.gn", "lto"),
            ],
        }
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            source_resource: "chromium".to_string(),
            out_dir: PathBuf::from("out/Ultimate"),
            flags_manifest: PathBuf::from("config/args.gn"),
            gen: CommandTemplate::new("gn", ["gen", "{{ out_dir }}"]),
            list_args: CommandTemplate::new("gn", ["args", "{{ out_dir }}", "--list", "--short"]),
            build: CommandTemplate::new(
                "ninja",
                ["-C", "{{ out_dir }}", "-j", "{{ jobs }}", "{{ targets }}"],
            ),
            targets: vec!["chrome".to_string(), "chromedriver".to_string()],
            jobs: None,
            timeout_secs: None,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("chrome"),
            excellent_threshold: 70,
            good_threshold: 50,
            instruction_ceiling: 200_000,
            symbol_sample_limit: 500_000,
            model_file: None,
            readelf: "readelf".to_string(),
            nm: "nm".to_string(),
            objdump: "objdump".to_string(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            primary_artifact: PathBuf::from("chrome"),
            optional_artifacts: ["chromedriver", "chrome_sandbox", "libEGL.so", "libGLESv2.so", "icudtl.dat"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            resource_dirs: vec![PathBuf::from("locales"), PathBuf::from("resources")],
            bundle_prefix: "ultimate-chromium".to_string(),
            version: None,
            archive: CommandTemplate::new(
                "tar",
                ["-cJf", "{{ archive }}", "-C", "{{ parent_dir }}", "{{ bundle_name }}"],
            ),
        }
    }
}

impl BuildConfig {
    /// Load build configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse build configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BuildConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the build configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for resource in self.resources.iter().chain(std::iter::once(&self.toolchain.source)) {
            if !seen.insert(resource.name.as_str()) {
                anyhow::bail!("Duplicate resource name: {}", resource.name);
            }
            if resource.url.trim().is_empty() {
                anyhow::bail!("Resource '{}' has no url", resource.name);
            }
        }

        for (role, name) in [
            ("build.source_resource", &self.build.source_resource),
            ("patches.privacy.resource", &self.patches.privacy.resource),
            ("patches.optimization.resource", &self.patches.optimization.resource),
        ] {
            if self.resource(name).is_none() {
                anyhow::bail!("{} references unknown resource '{}'", role, name);
            }
        }

        if self.build.targets.is_empty() {
            anyhow::bail!("build.targets must name at least one target");
        }

        if self.package.primary_artifact.as_os_str().is_empty() {
            anyhow::bail!("package.primary_artifact must be set");
        }

        if self.verify.good_threshold > self.verify.excellent_threshold
            || self.verify.excellent_threshold > 100
        {
            anyhow::bail!(
                "verify thresholds must satisfy good ({}) <= excellent ({}) <= 100",
                self.verify.good_threshold,
                self.verify.excellent_threshold
            );
        }

        if self.verify.instruction_ceiling == 0 {
            anyhow::bail!("verify.instruction_ceiling must be positive");
        }

        Ok(())
    }

    /// Look up a synced resource by name
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = BuildConfig::from_yaml("{}").unwrap();
        assert_eq!(config.name, "ultimate-chromium");
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.toolchain.min_memory_gb, 4);
        assert_eq!(config.verify.excellent_threshold, 70);
        assert_eq!(config.verify.good_threshold, 50);
        assert_eq!(config.build.targets, vec!["chrome", "chromedriver"]);
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
name: "Nightly"
root_dir: "/srv/build"
build:
  targets: ["chrome"]
verify:
  excellent_threshold: 80
"#;

        let config = BuildConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name, "Nightly");
        assert_eq!(config.root_dir, PathBuf::from("/srv/build"));
        assert_eq!(config.build.targets, vec!["chrome"]);
        assert_eq!(config.build.out_dir, PathBuf::from("out/Ultimate"));
        assert_eq!(config.verify.excellent_threshold, 80);
        assert_eq!(config.verify.good_threshold, 50);
    }

    #[test]
    fn test_duplicate_resource_fails() {
        let yaml = r#"
resources:
  - name: "chromium"
    url: "https://example.org/a.git"
    path: "a"
  - name: "chromium"
    url: "https://example.org/b.git"
    path: "b"
"#;

        let err = BuildConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate resource name"));
    }

    #[test]
    fn test_unknown_source_resource_fails() {
        let yaml = r#"
build:
  source_resource: "firefox"
"#;

        let err = BuildConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("firefox"));
    }

    #[test]
    fn test_inverted_thresholds_fail() {
        let yaml = r#"
verify:
  excellent_threshold: 40
  good_threshold: 60
"#;

        assert!(BuildConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_targets_fail() {
        let yaml = r#"
build:
  targets: []
"#;

        assert!(BuildConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_template_render() {
        let template = CommandTemplate::new(
            "ninja",
            ["-C", "{{ out_dir }}", "-j", "{{ jobs }}", "{{ targets }}"],
        );
        let vars = TemplateVars::new()
            .set("out_dir", "out/Ultimate")
            .set("jobs", "16")
            .set_list("targets", vec!["chrome".into(), "chromedriver".into()]);

        let spec = template.render(&vars);
        assert_eq!(spec.program, "ninja");
        assert_eq!(
            spec.args,
            vec!["-C", "out/Ultimate", "-j", "16", "chrome", "chromedriver"]
        );
    }

    #[test]
    fn test_template_embedded_placeholder() {
        let template = CommandTemplate::new("cmake", ["-DCMAKE_INSTALL_PREFIX={{ install_dir }}"]);
        let vars = TemplateVars::new().set_path("install_dir", Path::new("/opt/llvm"));

        let spec = template.render(&vars);
        assert_eq!(spec.args, vec!["-DCMAKE_INSTALL_PREFIX=/opt/llvm"]);
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let template = CommandTemplate::new("echo", ["{{ missing }}"]);
        let spec = template.render(&TemplateVars::new());
        assert_eq!(spec.args, vec!["{{ missing }}"]);
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let template = CommandTemplate::new("sh", ["{{ install_dir }}:{{ jobs }}", "{{ open"]);
        let vars = TemplateVars::new()
            .set("install_dir", "/opt/{{ jobs }}")
            .set("jobs", "16");

        let spec = template.render(&vars);
        assert_eq!(spec.args, vec!["/opt/{{ jobs }}:16", "{{ open"]);
    }
}
