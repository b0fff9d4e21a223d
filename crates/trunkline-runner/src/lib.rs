//! Job and step execution engine for trunkline.

pub mod accelerator;
pub mod job;
pub mod shell;

pub use accelerator::{CacheSession, Sccache};
pub use job::{CancelSignal, JobRunner};
pub use shell::{RunnerConfig, ShellExecutor};
