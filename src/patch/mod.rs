//! Source-tree patching
//!
//! Two sets are applied per run, privacy first and optimization second;
//! the optimization diffs are authored against the privacy-patched tree.

pub mod applier;
pub mod set;

pub use applier::{check_markers, ApplyResult, MarkerCheck, PatchApplier};
pub use set::{PatchOperation, PatchSet, SubstitutionRule};
