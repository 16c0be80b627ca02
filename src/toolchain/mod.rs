//! Compiler toolchain selection
//!
//! A run uses exactly one toolchain: the custom-built one when its build
//! and probe compile succeed, otherwise the system fallback.

pub mod builder;
pub mod memory;
pub mod profile;

pub use builder::{jobs, ToolchainBuilder};
pub use memory::{FixedMemory, MemoryProbe, ProcMeminfo};
pub use profile::{ActiveToolchain, Capability, ProfileKind, ToolchainProfile};
