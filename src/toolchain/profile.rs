//! Toolchain profiles

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// An advanced optimization capability a toolchain can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Link-time optimization
    Lto,
    /// Profile-guided optimization
    Pgo,
    /// Polyhedral loop optimizer
    LoopOptimizer,
    /// Post-link binary layout optimizer
    PostLinkOptimizer,
    /// Target instruction-set extension
    TargetIsaExtension,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Lto,
        Capability::Pgo,
        Capability::LoopOptimizer,
        Capability::PostLinkOptimizer,
        Capability::TargetIsaExtension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Lto => "thin-lto",
            Capability::Pgo => "pgo",
            Capability::LoopOptimizer => "polly",
            Capability::PostLinkOptimizer => "bolt",
            Capability::TargetIsaExtension => "target-isa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileKind {
    CustomBuilt,
    SystemFallback,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::CustomBuilt => "custom-built",
            ProfileKind::SystemFallback => "system-fallback",
        }
    }
}

/// Requested capabilities plus resolved tool paths and flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainProfile {
    pub kind: ProfileKind,
    pub capabilities: BTreeSet<Capability>,

    /// `-march` value, only for profiles with the ISA capability
    pub target_isa: Option<String>,

    /// Install prefix; tools live under `bin/`
    pub prefix: PathBuf,

    /// Compiler selection variable -> tool path
    pub tools: BTreeMap<String, PathBuf>,

    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub ldflags: Vec<String>,
}

const TOOL_NAMES: [(&str, &str); 9] = [
    ("CC", "clang"),
    ("CXX", "clang++"),
    ("LD", "ld.lld"),
    ("AR", "llvm-ar"),
    ("NM", "llvm-nm"),
    ("RANLIB", "llvm-ranlib"),
    ("OBJCOPY", "llvm-objcopy"),
    ("OBJDUMP", "llvm-objdump"),
    ("STRIP", "llvm-strip"),
];

fn tools_under(prefix: &Path) -> BTreeMap<String, PathBuf> {
    let bin = prefix.join("bin");
    TOOL_NAMES
        .iter()
        .map(|(var, tool)| (var.to_string(), bin.join(tool)))
        .collect()
}

fn strings(flags: &[&str]) -> Vec<String> {
    flags.iter().map(|f| f.to_string()).collect()
}

impl ToolchainProfile {
    /// The full custom profile: every advanced capability requested
    pub fn custom(prefix: &Path, target_isa: &str) -> Self {
        let march = format!("-march={}", target_isa);
        let mut cflags = strings(&["-O3", "-flto=thin", "-mllvm", "-polly"]);
        cflags.push(march);
        let cxxflags = cflags.clone();

        Self {
            kind: ProfileKind::CustomBuilt,
            capabilities: Capability::ALL.into_iter().collect(),
            target_isa: Some(target_isa.to_string()),
            prefix: prefix.to_path_buf(),
            tools: tools_under(prefix),
            cflags,
            cxxflags,
            ldflags: strings(&[
                "-fuse-ld=lld",
                "-flto=thin",
                "-Wl,--lto-O3",
                "-Wl,--icf=all",
                "-Wl,--gc-sections",
                "-Wl,--emit-relocs",
            ]),
        }
    }

    /// Compile with merged profile data; without it no `-fprofile-use` is emitted
    pub fn with_profile_data(mut self, profdata: &Path) -> Self {
        let flag = format!("-fprofile-use={}", profdata.display());
        self.cflags.push(flag.clone());
        self.cxxflags.push(flag);
        self
    }

    /// Baseline system compiler: no advanced capabilities
    pub fn system_fallback(prefix: &Path) -> Self {
        Self {
            kind: ProfileKind::SystemFallback,
            capabilities: BTreeSet::new(),
            target_isa: None,
            prefix: prefix.to_path_buf(),
            tools: tools_under(prefix),
            cflags: strings(&["-O2"]),
            cxxflags: strings(&["-O2"]),
            ldflags: strings(&["-fuse-ld=lld"]),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn tool(&self, var: &str) -> Option<&Path> {
        self.tools.get(var).map(PathBuf::as_path)
    }

    /// Optimization features this profile actually supports
    pub fn features(&self) -> Vec<&'static str> {
        self.capabilities.iter().map(Capability::as_str).collect()
    }

    /// Compiler selection and flag variables for external commands
    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .tools
            .iter()
            .map(|(var, path)| (var.clone(), path.to_string_lossy().into_owned()))
            .collect();
        env.insert("CFLAGS".to_string(), self.cflags.join(" "));
        env.insert("CXXFLAGS".to_string(), self.cxxflags.join(" "));
        env.insert("LDFLAGS".to_string(), self.ldflags.join(" "));
        env
    }

    /// GN arguments that point the target build at this toolchain
    pub fn build_args(&self) -> String {
        let mut args = format!(
            "# toolchain: {} ({})\nclang_base_path = \"{}\"\nclang_use_chrome_plugins = false\n",
            self.kind.as_str(),
            if self.capabilities.is_empty() {
                "baseline".to_string()
            } else {
                self.features().join(", ")
            },
            self.prefix.display()
        );
        if !self.has(Capability::Pgo) {
            args.push_str("chrome_pgo_phase = 0\n");
        }
        args
    }
}

/// The toolchain selected for this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveToolchain {
    pub profile: ToolchainProfile,

    /// Why the custom build was abandoned, for system-fallback runs
    pub fallback_reason: Option<String>,
}

impl ActiveToolchain {
    pub fn new(profile: ToolchainProfile) -> Self {
        Self {
            profile,
            fallback_reason: None,
        }
    }

    pub fn fallback(profile: ToolchainProfile, reason: impl Into<String>) -> Self {
        Self {
            profile,
            fallback_reason: Some(reason.into()),
        }
    }

    /// "custom-built" or "system-fallback"
    pub fn tag(&self) -> &'static str {
        self.profile.kind.as_str()
    }

    pub fn is_fallback(&self) -> bool {
        self.profile.kind == ProfileKind::SystemFallback
    }
}
