//! Pipeline orchestration.
//!
//! Ties the pieces together for one run: classify the trigger, fix the
//! fail-fast decision, validate the declaration, then let the stage scheduler
//! hand out stages. Matrix stages fan out one task per job instance and join
//! on all of them before the stage completes; gated stages hold their
//! concurrency group for the whole stage.

use crate::dag::DagBuilder;
use crate::gate::ConcurrencyGate;
use crate::matrix::MatrixExpander;
use crate::policy::FailFastPolicy;
use crate::scheduler::{Advance, StageScheduler};
use crate::triggers::TriggerClassifier;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use trunkline_core::event::{Classification, TriggerEvent};
use trunkline_core::pipeline::{AxisBindings, PipelineDefinition, StageDefinition, StepDefinition};
use trunkline_core::cache::CacheStats;
use trunkline_core::ports::CacheAccelerator;
use trunkline_core::run::{
    JobInstance, JobReport, JobStatus, PipelineOutcome, StageReport, StageStatus, StepReport,
};
use trunkline_core::{ConfigError, Error, Result, RunId};
use trunkline_runner::{CacheSession, JobRunner};

/// Orchestrator knobs.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Default fan-out limit for matrix stages without their own.
    pub max_parallel: Option<usize>,
    /// Bound on how long a gated stage waits for its group. Unbounded if unset.
    pub gate_timeout: Option<Duration>,
}

impl OrchestratorConfig {
    /// A fresh gate honoring `gate_timeout`.
    pub fn gate(&self) -> ConcurrencyGate {
        match self.gate_timeout {
            Some(timeout) => ConcurrencyGate::with_timeout(timeout),
            None => ConcurrencyGate::new(),
        }
    }
}

/// What a run would do for a given trigger, computed without executing.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub pipeline: String,
    pub classification: Classification,
    pub fail_fast: bool,
    pub stages: Vec<PlannedStage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub name: String,
    pub depends_on: Vec<String>,
    pub jobs: Vec<AxisBindings>,
    /// Whether the stage's own run predicate holds for this trigger.
    pub predicate_holds: bool,
    pub concurrency_group: Option<String>,
}

/// Validated declaration plus per-run decisions.
struct Prepared {
    classification: Classification,
    policy: FailFastPolicy,
    scheduler: StageScheduler,
    jobs: HashMap<String, Vec<JobInstance>>,
}

fn prepare(
    definition: &PipelineDefinition,
    event: &TriggerEvent,
) -> std::result::Result<Prepared, ConfigError> {
    let classification = TriggerClassifier::new(&definition.trunk_branch).classify(event);
    let policy = FailFastPolicy::for_classification(&classification);
    let dag = DagBuilder::new().build(definition)?;

    let expander = MatrixExpander::new();
    let mut jobs = HashMap::new();
    for stage in dag.topological_order() {
        jobs.insert(stage.name.clone(), expander.expand(stage)?);
    }

    Ok(Prepared {
        classification,
        policy,
        scheduler: StageScheduler::new(dag, classification),
        jobs,
    })
}

/// Classify, validate and expand without running anything.
pub fn plan(
    definition: &PipelineDefinition,
    event: &TriggerEvent,
) -> std::result::Result<RunPlan, ConfigError> {
    let prepared = prepare(definition, event)?;

    let stages = prepared
        .scheduler
        .dag()
        .topological_order()
        .into_iter()
        .map(|stage| PlannedStage {
            name: stage.name.clone(),
            depends_on: stage.depends_on.clone(),
            jobs: prepared.jobs[&stage.name]
                .iter()
                .map(|job| job.bindings.clone())
                .collect(),
            predicate_holds: stage.when.evaluate(&prepared.classification),
            concurrency_group: stage.concurrency_group.clone(),
        })
        .collect();

    Ok(RunPlan {
        pipeline: definition.name.clone(),
        classification: prepared.classification,
        fail_fast: prepared.policy.enabled(),
        stages,
    })
}

/// Runs pipelines. Cheap to clone; clones share the concurrency gate so
/// overlapping runs serialize their gated stages.
#[derive(Clone)]
pub struct Orchestrator {
    runner: JobRunner,
    gate: Arc<ConcurrencyGate>,
    accelerator: Option<Arc<dyn CacheAccelerator>>,
    config: OrchestratorConfig,
}

/// What one executed stage produced.
#[derive(Default)]
struct StageRun {
    jobs: Vec<JobReport>,
    cache: Vec<StepReport>,
    cache_stats: Option<CacheStats>,
}

impl Orchestrator {
    pub fn new(runner: JobRunner, gate: Arc<ConcurrencyGate>) -> Self {
        Self {
            runner,
            gate,
            accelerator: None,
            config: OrchestratorConfig::default(),
        }
    }

    /// Share one cache server across the jobs of each accelerated stage.
    pub fn with_accelerator(mut self, accelerator: Arc<dyn CacheAccelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Run a pipeline for `event` under a fresh run id.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        event: TriggerEvent,
    ) -> Result<PipelineOutcome> {
        self.run_with_id(RunId::new(), definition, event).await
    }

    /// Run a pipeline. Declaration errors are returned before any job starts;
    /// job and stage failures are reported in the outcome.
    #[instrument(skip_all, fields(pipeline = %definition.name, run_id = %run_id))]
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        definition: &PipelineDefinition,
        event: TriggerEvent,
    ) -> Result<PipelineOutcome> {
        let started_at = chrono::Utc::now();
        let clock = std::time::Instant::now();

        let Prepared {
            classification,
            policy,
            mut scheduler,
            mut jobs,
        } = prepare(definition, &event)?;

        info!(
            trigger = %event.trigger_kind,
            git_ref = %event.git_ref,
            is_pull_request = classification.is_pull_request,
            is_trunk_push = classification.is_trunk_push,
            is_tag = classification.is_tag,
            fail_fast = policy.enabled(),
            "Pipeline run started"
        );

        let mut running = JoinSet::new();
        let mut reports: HashMap<String, StageRun> = HashMap::new();

        loop {
            match scheduler.advance() {
                Advance::Run(name) => {
                    let stage = scheduler
                        .dag()
                        .stage(&name)
                        .cloned()
                        .ok_or_else(|| Error::Internal(format!("unknown stage {}", name)))?;
                    let stage_jobs = jobs.remove(&name).unwrap_or_default();
                    let this = self.clone();
                    running.spawn(async move {
                        let result = this.execute_stage(run_id, &stage, stage_jobs, policy).await;
                        (name, result)
                    });
                }
                Advance::Wait => {
                    let Some(joined) = running.join_next().await else {
                        return Err(Error::Internal(
                            "scheduler waiting with no running stage".to_string(),
                        ));
                    };
                    let (name, result) =
                        joined.map_err(|e| Error::Internal(format!("stage task failed: {}", e)))?;
                    let succeeded = match result {
                        Ok(stage_run) => {
                            let ok = stage_run
                                .jobs
                                .iter()
                                .all(|r| r.status == JobStatus::Succeeded);
                            reports.insert(name.clone(), stage_run);
                            ok
                        }
                        Err(e) => {
                            error!(stage = %name, error = %e, "Stage could not run");
                            false
                        }
                    };
                    scheduler.complete(&name, succeeded)?;
                }
                Advance::Done(status) => {
                    let stages = scheduler
                        .dag()
                        .topological_order()
                        .into_iter()
                        .map(|stage| {
                            let run = reports.remove(&stage.name).unwrap_or_default();
                            StageReport {
                                name: stage.name.clone(),
                                status: scheduler
                                    .status(&stage.name)
                                    .unwrap_or(StageStatus::Skipped),
                                skip_reason: scheduler.skip_reason(&stage.name).cloned(),
                                jobs: run.jobs,
                                cache: run.cache,
                                cache_stats: run.cache_stats,
                            }
                        })
                        .collect();

                    let duration_ms = clock.elapsed().as_millis() as u64;
                    if status.is_success() {
                        info!(duration_ms, "Pipeline succeeded");
                    } else {
                        warn!(duration_ms, "Pipeline failed");
                    }

                    return Ok(PipelineOutcome {
                        run_id,
                        pipeline: definition.name.clone(),
                        status,
                        event,
                        classification,
                        fail_fast: policy.enabled(),
                        stages,
                        started_at,
                        completed_at: chrono::Utc::now(),
                        duration_ms,
                    });
                }
            }
        }
    }

    /// Run every job of one stage and join on all of them. An accelerated
    /// stage brackets its fan-out with a single cache session, so the server
    /// outlives every job that compiles against it.
    async fn execute_stage(
        &self,
        run_id: RunId,
        stage: &StageDefinition,
        jobs: Vec<JobInstance>,
        policy: FailFastPolicy,
    ) -> Result<StageRun> {
        // Held until this function returns, on every path.
        let _permit = match &stage.concurrency_group {
            Some(group) => Some(self.gate.acquire(group, run_id).await?),
            None => None,
        };

        let max_parallel = if stage.is_matrix() {
            stage
                .matrix
                .as_ref()
                .and_then(|m| m.max_parallel)
                .or(self.config.max_parallel)
        } else {
            None
        };
        let limiter = max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let cancellation = policy.arm(&stage.name);
        let steps: Arc<[StepDefinition]> = stage.steps.clone().into();

        let mut cache = Vec::new();
        let session = match &self.accelerator {
            Some(accelerator)
                if stage.accelerate && !jobs.is_empty() && steps.iter().any(|s| s.compiles) =>
            {
                let (session, report) = CacheSession::start(accelerator.as_ref()).await;
                cache.push(report);
                Some(session)
            }
            _ => None,
        };
        let cache_env = Arc::new(session.as_ref().map(|s| s.env()).unwrap_or_default());

        info!(stage = %stage.name, jobs = jobs.len(), ?max_parallel, "Fanning out jobs");

        let mut set = JoinSet::new();
        for mut job in jobs {
            let runner = self.runner.clone();
            let cancellation = cancellation.clone();
            let limiter = limiter.clone();
            let steps = steps.clone();
            let cache_env = cache_env.clone();

            set.spawn(async move {
                let _slot = match limiter {
                    Some(limiter) => limiter.acquire_owned().await.ok(),
                    None => None,
                };
                let report = runner.run(&mut job, &steps, &cache_env, &cancellation).await;
                (job.index, report)
            });
        }

        let mut indexed = Vec::new();
        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => indexed.push(entry),
                Err(e) => failure = Some(Error::Internal(format!("job task failed: {}", e))),
            }
        }

        let mut cache_stats = None;
        if let Some(session) = session {
            let (reports, stats) = session.close().await;
            cache.extend(reports);
            cache_stats = stats;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        Ok(StageRun {
            jobs: indexed.into_iter().map(|(_, report)| report).collect(),
            cache,
            cache_stats,
        })
    }
}
