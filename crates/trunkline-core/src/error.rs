//! Error types for trunkline.

use thiserror::Error;

/// Problems with a pipeline declaration. Always fatal, always raised before
/// any job runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Pipeline declares no stages")]
    EmptyPipeline,

    #[error("Stage declared more than once: {0}")]
    DuplicateStage(String),

    #[error("Stage {stage} depends on unknown stage: {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Cycle detected in stage dependencies involving: {0}")]
    CyclicDependency(String),

    #[error("Empty matrix for stage: {0}")]
    EmptyMatrix(String),

    #[error("Axis {axis} of stage {stage} has no values")]
    EmptyAxis { stage: String, axis: String },

    #[error("Axis {axis} declared more than once in stage {stage}")]
    DuplicateAxis { stage: String, axis: String },

    #[error("Axis {axis} of stage {stage} lists {value} more than once")]
    DuplicateAxisValue {
        stage: String,
        axis: String,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),

    // Step errors
    #[error("Failed to spawn step command: {0}")]
    Spawn(String),

    #[error("Step timeout after {seconds} seconds")]
    StepTimeout { seconds: u64 },

    // Accelerator errors
    #[error("Cache accelerator unreachable: {0}")]
    AcceleratorUnreachable(String),

    // Gate errors
    #[error("Timed out after {waited_ms}ms waiting for concurrency group {group}")]
    GateTimeout { group: String, waited_ms: u64 },

    #[error("Concurrency group {group} is not held by {run_id}")]
    GateNotHeld { group: String, run_id: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
