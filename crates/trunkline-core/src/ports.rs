//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! external collaborators it drives: the command executor that runs a step and
//! the compiler-cache accelerator that wraps compiling steps.

use crate::Result;
use crate::cache::CacheStats;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything an executor needs to run one step of one job.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Display name of the job, e.g. `test (platform=ubuntu)`.
    pub job: String,
    pub step: String,
    /// Opaque command string. The core never interprets its syntax.
    pub command: String,
    pub workspace: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Result of running one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a step's command and reports its exit status.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a step. `Err` means the command could not be run at all and is
    /// treated like a non-zero exit by the job runner.
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult>;
}

/// Compiler-cache server with a start/report/stop lifecycle.
#[async_trait]
pub trait CacheAccelerator: Send + Sync {
    /// Short name used in step reports and logs.
    fn name(&self) -> &str;

    /// Start the server. Fails with `Error::AcceleratorUnreachable`.
    async fn start(&self) -> Result<()>;

    /// Snapshot the counters of a running server.
    async fn report_stats(&self) -> Result<CacheStats>;

    /// Stop the server. Callers ignore the result.
    async fn stop(&self) -> Result<()>;

    /// Environment that routes compiler invocations through the cache.
    fn env(&self) -> BTreeMap<String, String>;
}
