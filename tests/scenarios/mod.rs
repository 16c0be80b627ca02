//! Scenario-based tests for ultibuild

mod cancellation;
mod dry_run;
mod full_run;
mod idempotent_rerun;
mod low_memory;
mod packaging;
mod patch_conflict;
mod toolchain_fallback;
