//! Scoped cleanup for one run

use crate::core::PipelinePaths;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Owns the per-run scratch directory
///
/// Acquired when a run starts and dropped on every exit path: normal
/// completion, a fatal stage error, or the run future being dropped on
/// cancellation. Dropping removes the scratch directory. Logs and stamps
/// are never touched.
#[derive(Debug)]
pub struct RunGuard {
    scratch: PathBuf,
    released: bool,
}

impl RunGuard {
    /// Take ownership of the run's scratch directory; nothing is created here
    pub fn acquire(paths: &PipelinePaths) -> Self {
        debug!("run guard acquired for {}", paths.scratch.display());
        Self {
            scratch: paths.scratch.clone(),
            released: false,
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Remove temporary files now instead of at drop
    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.scratch.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.scratch) {
                warn!("could not remove {}: {}", self.scratch.display(), e);
                return;
            }
            debug!("removed {}", self.scratch.display());
        }

        // The shared scratch parent goes too once no run is using it
        if let Some(parent) = self.scratch.parent() {
            let empty = std::fs::read_dir(parent)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                let _ = std::fs::remove_dir(parent);
            }
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
