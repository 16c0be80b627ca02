//! Core domain models
//!
//! Configuration, the per-run context, stage definitions, run state and
//! the error taxonomy shared by every component.

pub mod config;
pub mod context;
pub mod error;
pub mod stage;
pub mod state;

pub use config::*;
pub use context::*;
pub use error::*;
pub use stage::*;
pub use state::*;
