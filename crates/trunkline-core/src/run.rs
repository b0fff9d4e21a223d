//! Run, stage, job and step state plus the outcome report.

use crate::cache::CacheStats;
use crate::event::{Classification, TriggerEvent};
use crate::ids::{JobId, RunId};
use crate::pipeline::AxisBindings;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `as_str` and `Display` matching the serde names.
macro_rules! status_names {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// A best-effort step failed; the job carries on.
    Tolerated,
    /// Applicability predicate was false.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Succeeded)
    }
}

status_names!(JobStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

status_names!(StepStatus {
    Succeeded => "succeeded",
    Failed => "failed",
    Tolerated => "tolerated",
    Skipped => "skipped",
});

status_names!(StageStatus {
    Waiting => "waiting",
    Ready => "ready",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Skipped => "skipped",
});

status_names!(PipelineStatus {
    Succeeded => "succeeded",
    Failed => "failed",
});

/// Why a stage never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", content = "stage", rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed(String),
    DependencySkipped(String),
    PredicateFalse,
}

/// One matrix combination of a stage, or the single job of a singleton stage.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: JobId,
    pub stage: String,
    pub index: usize,
    pub bindings: AxisBindings,
    pub status: JobStatus,
}

impl JobInstance {
    pub fn new(stage: impl Into<String>, index: usize, bindings: AxisBindings) -> Self {
        Self {
            id: JobId::new(),
            stage: stage.into(),
            index,
            bindings,
            status: JobStatus::Pending,
        }
    }

    pub fn singleton(stage: impl Into<String>) -> Self {
        Self::new(stage, 0, AxisBindings::new())
    }

    pub fn display_name(&self) -> String {
        if self.bindings.is_empty() {
            return self.stage.clone();
        }
        format!("{} ({})", self.stage, self.bindings)
    }

    /// Move to `next` if legal. Terminal states are never left.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl StepReport {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobReport {
    pub job_id: JobId,
    pub stage: String,
    pub bindings: AxisBindings,
    pub status: JobStatus,
    pub steps: Vec<StepReport>,
}

impl JobReport {
    pub fn new(job: &JobInstance) -> Self {
        Self {
            job_id: job.id,
            stage: job.stage.clone(),
            bindings: job.bindings.clone(),
            status: job.status,
            steps: Vec::new(),
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub jobs: Vec<JobReport>,
    /// Start, stats and stop of the stage's cache accelerator session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache: Vec<StepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_stats: Option<CacheStats>,
}

impl StageReport {
    /// The job bound to `value` on `axis`, if any.
    pub fn job(&self, axis: &str, value: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.bindings.get(axis) == Some(value))
    }
}

/// What a caller observes once a run finishes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineOutcome {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: PipelineStatus,
    pub event: TriggerEvent,
    pub classification: Classification,
    pub fail_fast: bool,
    pub stages: Vec<StageReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PipelineOutcome {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}
