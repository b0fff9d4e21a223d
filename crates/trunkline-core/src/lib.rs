//! trunkline core
//!
//! Core domain types, traits, and error handling for trunkline.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the runner, the scheduler and the CLI.

pub mod cache;
pub mod error;
pub mod event;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{ConfigError, Error, Result};
pub use ids::*;
