//! Fail-fast policy.

use tokio_util::sync::CancellationToken;
use tracing::info;
use trunkline_core::event::Classification;
use trunkline_core::run::JobStatus;
use trunkline_runner::CancelSignal;

/// Whether a failing job cancels its siblings.
///
/// Decided once per run from the trigger classification: trunk pushes report
/// the full matrix, everything else (pull requests, other branches, tags and
/// unrecognized triggers) fails fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailFastPolicy {
    enabled: bool,
}

impl FailFastPolicy {
    pub fn for_classification(classification: &Classification) -> Self {
        let disabled = !classification.is_pull_request
            && classification.is_trunk_push
            && !classification.is_tag;
        Self { enabled: !disabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_cancel_siblings(&self, outcome: JobStatus) -> bool {
        self.enabled && outcome == JobStatus::Failed
    }

    /// Arm a stage-scoped trip wire for this policy.
    pub fn arm(&self, stage: &str) -> StageCancellation {
        StageCancellation {
            policy: *self,
            stage: stage.to_string(),
            token: CancellationToken::new(),
        }
    }
}

/// Cancellation shared by every instance of one matrix stage.
///
/// Set at most once; instances observe it at their next step boundary.
#[derive(Debug, Clone)]
pub struct StageCancellation {
    policy: FailFastPolicy,
    stage: String,
    token: CancellationToken,
}

impl StageCancellation {
    /// Report a job's terminal status. Returns true if this report tripped
    /// the cancellation.
    pub fn observe(&self, job: &str, outcome: JobStatus) -> bool {
        if !self.policy.should_cancel_siblings(outcome) || self.token.is_cancelled() {
            return false;
        }
        info!(stage = %self.stage, failed_job = %job, "Fail-fast: cancelling sibling jobs");
        self.token.cancel();
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl CancelSignal for StageCancellation {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    // Fires before the failing job cleans up, so siblings stop at their next
    // step boundary rather than after the failed job returns.
    fn job_finished(&self, job: &str, outcome: JobStatus) {
        self.observe(job, outcome);
    }
}
