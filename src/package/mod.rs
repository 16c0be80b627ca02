//! Artifact packaging
//!
//! Collects build outputs into a timestamped bundle directory, records
//! provenance and archives the bundle.

pub mod provenance;

pub use provenance::Provenance;

use crate::core::{PipelineContext, PipelineError, TemplateVars};
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// A named build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,

    /// Packaging fails when a required artifact is absent
    pub required: bool,
}

impl Artifact {
    pub fn required(path: PathBuf) -> Self {
        Self {
            name: display_name(&path),
            path,
            required: true,
        }
    }

    pub fn optional(path: PathBuf) -> Self {
        Self {
            name: display_name(&path),
            path,
            required: false,
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    pub bundle_dir: PathBuf,

    /// None when archiving failed; the bundle directory is still complete
    pub archive: Option<PathBuf>,

    pub copied: Vec<String>,
    pub skipped: Vec<String>,
}

impl PackageResult {
    /// The archive when there is one, otherwise the bundle directory
    pub fn output(&self) -> &Path {
        self.archive.as_deref().unwrap_or(&self.bundle_dir)
    }
}

pub struct ArtifactPackager {
    runner: Arc<dyn CommandRunner>,
}

impl ArtifactPackager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Bundle `artifacts` and `resource_dirs` under the artifacts directory
    ///
    /// Fails only when a required artifact is missing or cannot be copied.
    /// Missing optional items and a failed archive step are warnings.
    pub async fn package(
        &self,
        artifacts: &[Artifact],
        resource_dirs: &[PathBuf],
        ctx: &mut PipelineContext,
    ) -> Result<PackageResult, PipelineError> {
        for artifact in artifacts.iter().filter(|a| a.required) {
            if !artifact.path.is_file() {
                return Err(PipelineError::PackagingFailure(format!(
                    "required artifact {} missing at {}",
                    artifact.name,
                    artifact.path.display()
                )));
            }
        }

        let version = self.version(ctx);
        let bundle_dir = unique_bundle_dir(
            &ctx.paths.artifacts,
            &format!(
                "{}-{}-{}",
                ctx.config.package.bundle_prefix,
                version,
                chrono::Utc::now().format("%Y%m%d-%H%M%S")
            ),
        );
        std::fs::create_dir_all(&bundle_dir)
            .map_err(|e| PipelineError::io(format!("creating {}", bundle_dir.display()), e))?;
        info!("Packaging into {}", bundle_dir.display());

        let mut copied = Vec::new();
        let mut skipped = Vec::new();

        for artifact in artifacts {
            if !artifact.path.is_file() {
                ctx.warn(format!("optional artifact {} not found, skipping", artifact.name));
                skipped.push(artifact.name.clone());
                continue;
            }
            match std::fs::copy(&artifact.path, bundle_dir.join(&artifact.name)) {
                Ok(_) => copied.push(artifact.name.clone()),
                Err(e) if artifact.required => {
                    return Err(PipelineError::PackagingFailure(format!(
                        "copying required artifact {}: {}",
                        artifact.name, e
                    )))
                }
                Err(e) => {
                    ctx.warn(format!("could not copy optional artifact {}: {}", artifact.name, e));
                    skipped.push(artifact.name.clone());
                }
            }
        }

        for dir in resource_dirs {
            let name = display_name(dir);
            if !dir.is_dir() {
                ctx.warn(format!("resource directory {} not found, skipping", name));
                skipped.push(name);
                continue;
            }
            match copy_tree(dir, &bundle_dir.join(&name)) {
                Ok(files) => {
                    debug!("copied {} files from {}", files, dir.display());
                    copied.push(name);
                }
                Err(e) => {
                    ctx.warn(format!("could not copy resource directory {}: {}", name, e));
                    skipped.push(name);
                }
            }
        }

        let provenance = Provenance::collect(ctx, &version);
        let manifest = bundle_dir.join(provenance::FILE_NAME);
        std::fs::write(&manifest, provenance.render())
            .map_err(|e| PipelineError::io(format!("writing {}", manifest.display()), e))?;

        let archive = self.archive(&bundle_dir, ctx).await;

        Ok(PackageResult {
            bundle_dir,
            archive,
            copied,
            skipped,
        })
    }

    /// Configured version, else the pin of the source resource
    fn version(&self, ctx: &PipelineContext) -> String {
        if let Some(version) = &ctx.config.package.version {
            return version.clone();
        }
        ctx.config
            .resource(&ctx.config.build.source_resource)
            .and_then(|r| r.pin_file.as_ref())
            .and_then(|pin| std::fs::read_to_string(ctx.paths.under_root(pin)).ok())
            .and_then(|content| content.lines().next().map(|l| l.trim().to_string()))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "unversioned".to_string())
    }

    async fn archive(&self, bundle_dir: &Path, ctx: &mut PipelineContext) -> Option<PathBuf> {
        let parent = bundle_dir.parent()?;
        let bundle_name = bundle_dir.file_name()?.to_string_lossy().into_owned();
        let archive = parent.join(format!("{}.tar.xz", bundle_name));

        let vars = TemplateVars::new()
            .set_path("archive", &archive)
            .set_path("parent_dir", parent)
            .set_path("bundle_dir", bundle_dir)
            .set("bundle_name", bundle_name);
        let cmd = ctx
            .config
            .package
            .archive
            .render(&vars)
            .cwd(parent)
            .envs(&ctx.env)
            .log_to(ctx.paths.log("package.log"));

        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => Some(archive),
            Ok(output) => {
                ctx.warn(format!("archiving failed, bundle left unarchived: {}", output.diagnostic()));
                None
            }
            Err(e) => {
                ctx.warn(format!("archiving failed, bundle left unarchived: {}", e));
                None
            }
        }
    }
}

fn unique_bundle_dir(parent: &Path, base: &str) -> PathBuf {
    let candidate = parent.join(base);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| parent.join(format!("{}-{}", base, n)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Recursively copy `src` to `dest`; returns the number of files copied
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}
