//! Shared fixtures and fakes for orchestration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use trunkline_core::cache::CacheStats;
use trunkline_core::pipeline::{
    Axis, AxisCondition, MatrixConfig, PipelineDefinition, RunPredicate, StageDefinition,
    StepDefinition,
};
use trunkline_core::ports::{CacheAccelerator, CommandExecutor, StepContext, StepResult};
use trunkline_core::{Error, Result};
use trunkline_runner::JobRunner;
use trunkline_scheduler::{ConcurrencyGate, Orchestrator, OrchestratorConfig};

/// Initialize test logging (safe to call from every test).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,trunkline_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Executor that records calls and fails commands for chosen jobs.
#[derive(Default)]
pub struct FakeExecutor {
    /// `(job display name fragment, command)` pairs that exit 1.
    failing: Vec<(String, String)>,
    /// Commands that sleep before returning, optionally only for some jobs.
    slow: Vec<(Option<String>, String, Duration)>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak: Mutex<BTreeMap<String, usize>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, job: &str, command: &str) -> Self {
        self.failing.push((job.to_string(), command.to_string()));
        self
    }

    pub fn slow(mut self, command: &str, delay: Duration) -> Self {
        self.slow.push((None, command.to_string(), delay));
        self
    }

    pub fn slow_for(mut self, job: &str, command: &str, delay: Duration) -> Self {
        self.slow
            .push((Some(job.to_string()), command.to_string(), delay));
        self
    }

    /// Every `(job, command)` executed, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, job: &str, command: &str) -> bool {
        self.calls()
            .iter()
            .any(|(j, c)| j.contains(job) && c == command)
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|(_, c)| c == command).count()
    }

    /// Highest number of simultaneous executions of `command` observed.
    pub fn peak(&self, command: &str) -> usize {
        self.peak.lock().unwrap().get(command).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.job.clone(), ctx.command.clone()));

        let delay = self
            .slow
            .iter()
            .find(|(job, c, _)| {
                *c == ctx.command && job.as_ref().is_none_or(|j| ctx.job.contains(j.as_str()))
            })
            .map(|(_, _, d)| *d);
        if let Some(delay) = delay {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut peak = self.peak.lock().unwrap();
                let entry = peak.entry(ctx.command.clone()).or_default();
                *entry = (*entry).max(now);
            }
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let fails = self
            .failing
            .iter()
            .any(|(job, command)| ctx.job.contains(job.as_str()) && *command == ctx.command);
        Ok(StepResult {
            exit_code: if fails { 1 } else { 0 },
            duration_ms: 1,
        })
    }
}

/// Accelerator with switchable failure modes.
#[derive(Default)]
pub struct FakeAccelerator {
    pub fail_stop: bool,
    pub stop_delay: Option<Duration>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

#[async_trait]
impl CacheAccelerator for FakeAccelerator {
    fn name(&self) -> &str {
        "sccache"
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn report_stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            compile_requests: 10,
            cache_hits: 7,
            cache_misses: 3,
            ..Default::default()
        })
    }

    async fn stop(&self) -> Result<()> {
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(Error::AcceleratorUnreachable("server already gone".into()));
        }
        Ok(())
    }

    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("RUSTC_WRAPPER".to_string(), "sccache".to_string())])
    }
}

/// Matrix `test` stage over three platforms plus a gated `release` stage that
/// only runs for trunk pushes.
pub fn ci_pipeline() -> PipelineDefinition {
    PipelineDefinition {
        name: "ci".to_string(),
        trunk_branch: "main".to_string(),
        stages: vec![
            StageDefinition {
                name: "test".to_string(),
                display_name: None,
                depends_on: vec![],
                when: RunPredicate::Always,
                concurrency_group: None,
                matrix: Some(MatrixConfig {
                    axes: vec![Axis::new("platform", ["macos", "windows", "ubuntu"])],
                    max_parallel: None,
                }),
                accelerate: true,
                steps: vec![
                    StepDefinition::new("build", "cargo build").compiling(),
                    StepDefinition::new("test", "cargo test").compiling(),
                    StepDefinition::new("clippy", "cargo clippy")
                        .when(AxisCondition::equals("platform", "ubuntu")),
                ],
            },
            StageDefinition {
                name: "release".to_string(),
                display_name: None,
                depends_on: vec!["test".to_string()],
                when: RunPredicate::TrunkPush,
                concurrency_group: Some("release".to_string()),
                matrix: None,
                accelerate: false,
                steps: vec![StepDefinition::new("publish", "cargo publish")],
            },
        ],
    }
}

pub struct Harness {
    pub executor: Arc<FakeExecutor>,
    pub accelerator: Arc<FakeAccelerator>,
    pub gate: Arc<ConcurrencyGate>,
    pub orchestrator: Orchestrator,
}

pub fn harness(executor: FakeExecutor, accelerator: FakeAccelerator) -> Harness {
    harness_with(executor, accelerator, OrchestratorConfig::default())
}

pub fn harness_with(
    executor: FakeExecutor,
    accelerator: FakeAccelerator,
    config: OrchestratorConfig,
) -> Harness {
    init_test_logging();

    let executor = Arc::new(executor);
    let accelerator = Arc::new(accelerator);
    let gate = Arc::new(ConcurrencyGate::new());
    let runner = JobRunner::new(executor.clone(), std::env::temp_dir());
    let orchestrator = Orchestrator::new(runner, gate.clone())
        .with_accelerator(accelerator.clone())
        .with_config(config);

    Harness {
        executor,
        accelerator,
        gate,
        orchestrator,
    }
}
