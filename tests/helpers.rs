//! Test utility functions for ultibuild scenarios

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ultibuild::core::{BuildConfig, PipelineContext, StageId};
use ultibuild::execution::{PipelineOrchestrator, RunFailure, RunOptions};
use ultibuild::runner::{CommandOutput, CommandSpec, ScriptedRunner};
use ultibuild::toolchain::FixedMemory;

pub const REVISION: &str = "4f2a9c1d0e7b";
pub const CHROMIUM_VERSION: &str = "120.0.6099.224";

pub const READELF_SECTIONS: &str = "\
Section Headers:
  [Nr] Name              Type            Address          Off    Size   ES Flg Lk Inf Al
  [ 0]                   NULL            0000000000000000 000000 000000 00      0   0  0
  [ 1] .text.hot         PROGBITS        0000000000401000 001000 000100 00  AX  0   0 16
  [ 2] .text.unlikely    PROGBITS        0000000000401100 001100 000100 00  AX  0   0 16
  [ 3] .text             PROGBITS        0000000000401200 001200 000200 00  AX  0   0 16
";

pub const READELF_COMMENT: &str = "\
String dump of section '.comment':
  [     0]  Linker: LLD 18.1.0
  [    13]  clang version 18.1.0
";

pub const NM_SYMBOLS: &str = "\
0000000000401000 T main
0000000000401100 t LayoutBlock.llvm.8812
0000000000401200 t Paint.cold
";

pub const OBJDUMP: &str = "\
chrome:     file format elf64-x86-64

Disassembly of section .text:

0000000000401000 <main>:
  401000:\tendbr64
  401004:\tvfmadd231ps %zmm1,%zmm2,%zmm0
  40100a:\tvmovaps %ymm0,(%rdi)
  40100e:\tret
";

/// A build rooted in a fresh temporary directory
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub config: BuildConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuildConfig {
            root_dir: dir.path().join("build"),
            ..BuildConfig::default()
        };
        config.dependencies.required_tools.clear();
        config.build.jobs = Some(4);

        let workspace = Self { dir, config };
        workspace.write_manifest();
        workspace
    }

    pub fn root(&self) -> &Path {
        &self.config.root_dir
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn context(&self) -> PipelineContext {
        PipelineContext::new(self.config.clone())
    }

    /// The static optimization flag manifest lives under the root
    pub fn write_manifest(&self) {
        let manifest = self.root().join(&self.config.build.flags_manifest);
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(manifest, "is_official_build = true\nuse_thin_lto = true\n").unwrap();
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[cfg(unix)]
fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    write(path, content);
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(not(unix))]
fn write_executable(path: &Path, content: &str) {
    write(path, content);
}

/// What a `git clone` of each default resource leaves on disk
fn populate_checkout(url: &str, dest: &Path) {
    fs::create_dir_all(dest).unwrap();
    if url.contains("ungoogled-chromium") {
        write(&dest.join("chromium_version.txt"), &format!("{}\n", CHROMIUM_VERSION));
        write(&dest.join("patches/core/series"), "0001-disable-metrics.patch\n0002-strip-urls.patch\n");
        write(&dest.join("patches/core/0001-disable-metrics.patch"), "--- a\n+++ b\n");
        write(&dest.join("patches/core/0002-strip-urls.patch"), "--- a\n+++ b\n");
        write(&dest.join("patches/extra/0001-hide-sync.patch"), "--- a\n+++ b\n");
        write(&dest.join("patches/inox-patchset/0001-no-hotword.patch"), "--- a\n+++ b\n");
        write(&dest.join("domain_substitution.list"), "base/url_constants.cc\n");
        write(&dest.join("domain_regex.list"), "google\\.com@9oo91e.qjz9zk\n");
        write(&dest.join("pruning.list"), "third_party/prebuilt/blob.bin\n");
        write(&dest.join("flags.gn"), "enable_reporting = false\nsafe_browsing_mode = 0\n");
    } else if url.contains("Chromium_Clang") {
        write(&dest.join("V8/v8-inline-budget.patch"), "--- a\n+++ b\n");
        write(&dest.join("Windows/win-avx512.patch"), "--- a\n+++ b\n");
        write(&dest.join("Windows/win-avx2.patch"), "--- a\n+++ b\n");
        write(&dest.join("Linux/lto-jobs.patch"), "--- a\n+++ b\n");
        write(&dest.join("Linux/gtk-theme.patch"), "--- a\n+++ b\n");
    } else if url.contains("chromium/src") {
        write(&dest.join("base/url_constants.cc"), "const char kHome[] = \"https://www.google.com/\";\n");
        write(&dest.join("third_party/prebuilt/blob.bin"), "binary");
    }
}

fn is_clone(cmd: &CommandSpec) -> bool {
    cmd.program == "git" && cmd.args.first().map(String::as_str) == Some("clone")
}

/// The target build: `ninja -C <out> -j N chrome chromedriver`
pub fn is_target_build(cmd: &CommandSpec) -> bool {
    cmd.program == "ninja" && cmd.args.iter().any(|a| a == "chrome")
}

/// What landing a diff leaves behind, for the diffs that carry markers
fn apply_diff_effects(cmd: &CommandSpec) {
    let (Some(tree), Some(patch)) = (cmd.cwd.as_ref(), cmd.args.last()) else {
        return;
    };
    if patch.ends_with("0001-disable-metrics.patch") {
        write(&tree.join("chrome/browser/chrome_browser_main.cc"), "// ungoogled-chromium: no metrics\n");
        write(&tree.join("chrome/browser/about_flags.cc"), "// ungoogled-chromium flags\n");
    } else if patch.ends_with("lto-jobs.patch") {
        write(&tree.join("build/config/compiler/BUILD.gn"), "cflags = [ \"-O3\" ]\nuse_thin_lto = true\n");
    }
}

fn out_dir_of(cmd: &CommandSpec) -> Option<PathBuf> {
    let at = cmd.args.iter().position(|a| a == "-C")?;
    cmd.args.get(at + 1).map(PathBuf::from)
}

/// A runner scripted for a successful run on `workspace`
///
/// Clones create their checkouts, the toolchain install drops a compiler
/// under the install prefix, the target build writes `chrome` and friends,
/// and the binary tools describe a well optimized binary.
pub fn happy_runner(workspace: &Workspace) -> ScriptedRunner {
    let install_bin = workspace
        .root()
        .join(&workspace.config.toolchain.install_dir)
        .join("bin");

    ScriptedRunner::new()
        .respond("rev-parse", CommandOutput::ok(format!("{}\n", REVISION)))
        .on(is_clone, |cmd| {
            let url = cmd.args.get(cmd.args.len().saturating_sub(2)).cloned().unwrap_or_default();
            if let Some(dest) = cmd.args.last() {
                populate_checkout(&url, Path::new(dest));
            }
            Ok(CommandOutput::ok(""))
        })
        .on(
            |cmd| cmd.program == "git" && cmd.args.first().map(String::as_str) == Some("apply"),
            |cmd| {
                apply_diff_effects(cmd);
                Ok(CommandOutput::ok(""))
            },
        )
        .on(
            |cmd| cmd.program == "ninja" && cmd.args.last().map(String::as_str) == Some("install"),
            move |_| {
                write_executable(&install_bin.join("clang"), "#!/bin/sh\n");
                write_executable(&install_bin.join("clang++"), "#!/bin/sh\n");
                Ok(CommandOutput::ok("-- Installing: clang"))
            },
        )
        .on(is_target_build, |cmd| {
            if let Some(out) = out_dir_of(cmd) {
                write_executable(&out.join("chrome"), "\x7fELF fake chrome");
                write_executable(&out.join("chromedriver"), "\x7fELF fake driver");
                write(&out.join("icudtl.dat"), "icu");
                write(&out.join("locales/en-US.pak"), "pak");
            }
            Ok(CommandOutput::ok("[52000/52000] LINK ./chrome"))
        })
        .respond("readelf -SW", CommandOutput::ok(READELF_SECTIONS))
        .respond("readelf -p .comment", CommandOutput::ok(READELF_COMMENT))
        .respond("nm --no-demangle", CommandOutput::ok(NM_SYMBOLS))
        .respond("objdump -d", CommandOutput::ok(OBJDUMP))
}

/// Run the standard pipeline against `workspace` with `runner`
pub async fn run_build(
    workspace: &Workspace,
    runner: Arc<ScriptedRunner>,
    memory_mb: u64,
    options: RunOptions,
) -> (PipelineContext, Result<(), RunFailure>) {
    let mut ctx = workspace.context();
    let orchestrator =
        PipelineOrchestrator::standard(runner, Arc::new(FixedMemory(memory_mb)), options);
    let result = orchestrator.run(&mut ctx).await;
    (ctx, result)
}

/// Plenty of memory for the custom toolchain
pub const AMPLE_MEMORY_MB: u64 = 64 * 1024;

pub fn assert_stage(ctx: &PipelineContext, stage: StageId, label: &str) {
    let state = ctx
        .state
        .get(stage)
        .unwrap_or_else(|| panic!("stage {} not tracked", stage));
    assert_eq!(
        state.label(),
        label,
        "stage {} expected {}, got {:?}",
        stage,
        label,
        state
    );
}

pub fn assert_warned(ctx: &PipelineContext, needle: &str) {
    assert!(
        ctx.warnings().any(|w| w.message.contains(needle)),
        "no warning containing {:?}; warnings: {:?}",
        needle,
        ctx.warnings().map(|w| w.message.clone()).collect::<Vec<_>>()
    );
}

pub fn read_report(workspace: &Workspace) -> String {
    fs::read_to_string(workspace.path("logs/report.txt")).unwrap()
}
