//! Target build: configuration generation and execution

pub mod executor;
pub mod generator;

pub use executor::{BuildExecutor, BuildResult};
pub use generator::{BuildConfigGenerator, ConfigHandle};
