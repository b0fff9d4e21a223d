//! Job runner: executes the ordered steps of one job instance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trunkline_core::pipeline::StepDefinition;
use trunkline_core::ports::{CommandExecutor, StepContext};
use trunkline_core::run::{JobInstance, JobReport, JobStatus, StepReport, StepStatus};

/// Cooperative cancellation as seen by one job.
pub trait CancelSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;

    /// Told the job's outcome as soon as it is decided, before the job
    /// returns. Sibling cancellation hooks in here.
    fn job_finished(&self, _job: &str, _outcome: JobStatus) {}
}

impl CancelSignal for CancellationToken {
    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

/// Runs jobs step by step through a [`CommandExecutor`].
#[derive(Clone)]
pub struct JobRunner {
    executor: Arc<dyn CommandExecutor>,
    workspace: PathBuf,
}

impl JobRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            workspace: workspace.into(),
        }
    }

    /// Run `job` through `steps`.
    ///
    /// `cancel` is observed before every step and once more after the last
    /// one: once it fires the job issues no further steps and ends
    /// `cancelled`, though an in-flight step is allowed to finish. A failed
    /// step still makes the job `failed`. `cache_env` is added to the
    /// environment of compiling steps.
    pub async fn run(
        &self,
        job: &mut JobInstance,
        steps: &[StepDefinition],
        cache_env: &BTreeMap<String, String>,
        cancel: &dyn CancelSignal,
    ) -> JobReport {
        let name = job.display_name();

        if cancel.is_cancelled() {
            job.transition(JobStatus::Cancelled);
            info!(job = %name, "Job cancelled before start");
            cancel.job_finished(&name, job.status);
            return JobReport::new(job);
        }

        job.transition(JobStatus::Running);
        info!(job = %name, steps = steps.len(), "Job started");

        let mut report = JobReport::new(job);
        let outcome = self
            .run_steps(job, steps, cache_env, &mut report, cancel)
            .await;

        job.transition(outcome);
        report.status = job.status;
        cancel.job_finished(&name, job.status);

        match job.status {
            JobStatus::Succeeded => info!(job = %name, "Job succeeded"),
            JobStatus::Cancelled => warn!(job = %name, "Job cancelled"),
            _ => error!(job = %name, "Job failed"),
        }

        report
    }

    async fn run_steps(
        &self,
        job: &JobInstance,
        steps: &[StepDefinition],
        cache_env: &BTreeMap<String, String>,
        report: &mut JobReport,
        cancel: &dyn CancelSignal,
    ) -> JobStatus {
        let name = job.display_name();

        for step in steps {
            if cancel.is_cancelled() {
                info!(job = %name, step = %step.name, "Cancellation observed, not starting step");
                return JobStatus::Cancelled;
            }

            if !step.applies_to(&job.bindings) {
                debug!(job = %name, step = %step.name, "Step not applicable, skipping");
                report.steps.push(StepReport::skipped(&step.name));
                continue;
            }

            let ctx = self.step_context(job, step, cache_env);
            info!(job = %name, step = %step.name, "Running step");

            let (status, exit_code, duration_ms) = match self.executor.execute(&ctx).await {
                Ok(result) if result.success() => {
                    (StepStatus::Succeeded, Some(result.exit_code), result.duration_ms)
                }
                Ok(result) => (
                    failed_status(step),
                    Some(result.exit_code),
                    result.duration_ms,
                ),
                Err(e) => {
                    error!(job = %name, step = %step.name, error = %e, "Step could not be executed");
                    (failed_status(step), None, 0)
                }
            };

            report.steps.push(StepReport {
                name: step.name.clone(),
                status,
                exit_code,
                duration_ms,
            });

            match status {
                StepStatus::Failed => {
                    error!(job = %name, step = %step.name, exit_code, "Step failed");
                    return JobStatus::Failed;
                }
                StepStatus::Tolerated => {
                    warn!(job = %name, step = %step.name, exit_code, "Best-effort step failed, continuing");
                }
                _ => {}
            }
        }

        // A sibling may have failed while the last step was in flight.
        if cancel.is_cancelled() {
            info!(job = %name, "Cancellation observed after last step");
            return JobStatus::Cancelled;
        }

        JobStatus::Succeeded
    }

    fn step_context(
        &self,
        job: &JobInstance,
        step: &StepDefinition,
        cache_env: &BTreeMap<String, String>,
    ) -> StepContext {
        let mut env = BTreeMap::new();
        for (axis, value) in job.bindings.iter() {
            env.insert(matrix_env_key(axis), value.to_string());
        }
        if step.compiles {
            env.extend(cache_env.clone());
        }
        env.extend(step.env.clone());

        StepContext {
            job: job.display_name(),
            step: step.name.clone(),
            command: step.run.clone(),
            workspace: self.workspace.clone(),
            env,
        }
    }
}

fn failed_status(step: &StepDefinition) -> StepStatus {
    if step.best_effort {
        StepStatus::Tolerated
    } else {
        StepStatus::Failed
    }
}

/// `platform` becomes `MATRIX_PLATFORM`.
pub fn matrix_env_key(axis: &str) -> String {
    let sanitized: String = axis
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MATRIX_{}", sanitized)
}
