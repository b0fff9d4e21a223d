//! Stage scheduling state machine.
//!
//! Each stage moves `waiting -> ready -> running -> {succeeded, failed}`, or
//! from `waiting` straight to `skipped`. A stage is considered only once every
//! dependency is terminal; its run predicate is then evaluated exactly once.

use crate::dag::PipelineDag;
use std::collections::HashMap;
use tracing::{debug, info};
use trunkline_core::event::Classification;
use trunkline_core::pipeline::StageDefinition;
use trunkline_core::run::{PipelineStatus, SkipReason, StageStatus};
use trunkline_core::{Error, Result};

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Start this stage; it is now `running`.
    Run(String),
    /// Nothing new is runnable until a running stage completes.
    Wait,
    /// Every stage is terminal.
    Done(PipelineStatus),
}

#[derive(Debug, Clone)]
struct StageEntry {
    status: StageStatus,
    skip_reason: Option<SkipReason>,
}

/// Drives the stages of one pipeline run.
#[derive(Debug)]
pub struct StageScheduler {
    dag: PipelineDag,
    classification: Classification,
    entries: HashMap<String, StageEntry>,
}

impl StageScheduler {
    pub fn new(dag: PipelineDag, classification: Classification) -> Self {
        let entries = dag
            .topological_order()
            .into_iter()
            .map(|stage| {
                (
                    stage.name.clone(),
                    StageEntry {
                        status: StageStatus::Waiting,
                        skip_reason: None,
                    },
                )
            })
            .collect();

        Self {
            dag,
            classification,
            entries,
        }
    }

    pub fn dag(&self) -> &PipelineDag {
        &self.dag
    }

    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.entries.get(stage).map(|e| e.status)
    }

    pub fn skip_reason(&self, stage: &str) -> Option<&SkipReason> {
        self.entries.get(stage).and_then(|e| e.skip_reason.as_ref())
    }

    /// Settle waiting stages whose dependencies are terminal, then hand out
    /// the next ready stage.
    pub fn advance(&mut self) -> Advance {
        let order: Vec<StageDefinition> =
            self.dag.topological_order().into_iter().cloned().collect();

        // Topological order lets skips cascade in a single pass.
        for stage in &order {
            if self.status(&stage.name) == Some(StageStatus::Waiting) {
                self.settle(stage);
            }
        }

        if let Some(stage) = order
            .iter()
            .find(|s| self.status(&s.name) == Some(StageStatus::Ready))
        {
            self.set_status(&stage.name, StageStatus::Running);
            info!(stage = %stage.name, "Stage started");
            return Advance::Run(stage.name.clone());
        }

        if self
            .entries
            .values()
            .any(|e| e.status == StageStatus::Running)
        {
            return Advance::Wait;
        }

        Advance::Done(self.pipeline_status())
    }

    fn settle(&mut self, stage: &StageDefinition) {
        let mut dependency_skipped = None;
        for dep in &stage.depends_on {
            match self.status(dep) {
                Some(StageStatus::Succeeded) => {}
                Some(StageStatus::Failed) => {
                    self.skip(&stage.name, SkipReason::DependencyFailed(dep.clone()));
                    return;
                }
                Some(StageStatus::Skipped) => {
                    dependency_skipped.get_or_insert_with(|| dep.clone());
                }
                _ => return,
            }
        }

        if let Some(dep) = dependency_skipped {
            self.skip(&stage.name, SkipReason::DependencySkipped(dep));
            return;
        }

        if stage.when.evaluate(&self.classification) {
            debug!(stage = %stage.name, "Stage ready");
            self.set_status(&stage.name, StageStatus::Ready);
        } else {
            self.skip(&stage.name, SkipReason::PredicateFalse);
        }
    }

    fn skip(&mut self, stage: &str, reason: SkipReason) {
        info!(stage, ?reason, "Stage skipped");
        if let Some(entry) = self.entries.get_mut(stage) {
            entry.status = StageStatus::Skipped;
            entry.skip_reason = Some(reason);
        }
    }

    fn set_status(&mut self, stage: &str, status: StageStatus) {
        if let Some(entry) = self.entries.get_mut(stage) {
            entry.status = status;
        }
    }

    /// Record the result of a running stage.
    pub fn complete(&mut self, stage: &str, succeeded: bool) -> Result<()> {
        match self.status(stage) {
            Some(StageStatus::Running) => {
                let status = if succeeded {
                    StageStatus::Succeeded
                } else {
                    StageStatus::Failed
                };
                info!(stage, ?status, "Stage completed");
                self.set_status(stage, status);
                Ok(())
            }
            Some(status) => Err(Error::Internal(format!(
                "stage {} completed while {:?}",
                stage, status
            ))),
            None => Err(Error::Internal(format!("unknown stage {}", stage))),
        }
    }

    /// `failed` if and only if some stage failed. Skipped stages never fail
    /// the pipeline.
    pub fn pipeline_status(&self) -> PipelineStatus {
        if self
            .entries
            .values()
            .any(|e| e.status == StageStatus::Failed)
        {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Succeeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use trunkline_core::pipeline::{PipelineDefinition, RunPredicate, StepDefinition};

    fn stage(name: &str, depends_on: &[&str], when: RunPredicate) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            display_name: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            when,
            concurrency_group: None,
            matrix: None,
            accelerate: false,
            steps: vec![StepDefinition::new("run", "true")],
        }
    }

    fn scheduler(stages: Vec<StageDefinition>, classification: Classification) -> StageScheduler {
        let dag = DagBuilder::new()
            .build(&PipelineDefinition {
                name: "ci".to_string(),
                trunk_branch: "main".to_string(),
                stages,
            })
            .unwrap();
        StageScheduler::new(dag, classification)
    }

    fn ci(classification: Classification) -> StageScheduler {
        scheduler(
            vec![
                stage("test", &[], RunPredicate::Always),
                stage("release", &["test"], RunPredicate::TrunkPush),
            ],
            classification,
        )
    }

    fn trunk() -> Classification {
        Classification {
            is_pull_request: false,
            is_trunk_push: true,
            is_tag: false,
        }
    }

    #[test]
    fn test_release_after_test_on_trunk() {
        let mut s = ci(trunk());
        assert_eq!(s.advance(), Advance::Run("test".to_string()));
        assert_eq!(s.status("release"), Some(StageStatus::Waiting));
        assert_eq!(s.advance(), Advance::Wait);

        s.complete("test", true).unwrap();
        assert_eq!(s.advance(), Advance::Run("release".to_string()));
        s.complete("release", true).unwrap();
        assert_eq!(s.advance(), Advance::Done(PipelineStatus::Succeeded));
    }

    #[test]
    fn test_failed_dependency_skips_dependent() {
        let mut s = ci(trunk());
        assert_eq!(s.advance(), Advance::Run("test".to_string()));
        s.complete("test", false).unwrap();

        assert_eq!(s.advance(), Advance::Done(PipelineStatus::Failed));
        assert_eq!(s.status("release"), Some(StageStatus::Skipped));
        assert_eq!(
            s.skip_reason("release"),
            Some(&SkipReason::DependencyFailed("test".to_string()))
        );
    }

    #[test]
    fn test_false_predicate_skips_even_after_success() {
        let mut s = ci(Classification::default());
        assert_eq!(s.advance(), Advance::Run("test".to_string()));
        s.complete("test", true).unwrap();

        assert_eq!(s.advance(), Advance::Done(PipelineStatus::Succeeded));
        assert_eq!(s.skip_reason("release"), Some(&SkipReason::PredicateFalse));
    }

    #[test]
    fn test_skips_cascade() {
        let mut s = scheduler(
            vec![
                stage("test", &[], RunPredicate::Always),
                stage("release", &["test"], RunPredicate::TrunkPush),
                stage("announce", &["release"], RunPredicate::Always),
            ],
            Classification::default(),
        );
        assert_eq!(s.advance(), Advance::Run("test".to_string()));
        s.complete("test", true).unwrap();

        assert_eq!(s.advance(), Advance::Done(PipelineStatus::Succeeded));
        assert_eq!(
            s.skip_reason("announce"),
            Some(&SkipReason::DependencySkipped("release".to_string()))
        );
    }

    #[test]
    fn test_independent_stages_run_together() {
        let mut s = scheduler(
            vec![
                stage("lint", &[], RunPredicate::Always),
                stage("test", &[], RunPredicate::Always),
                stage("release", &["lint", "test"], RunPredicate::Always),
            ],
            trunk(),
        );
        let first = s.advance();
        let second = s.advance();
        assert!(matches!(first, Advance::Run(_)));
        assert!(matches!(second, Advance::Run(_)));
        assert_ne!(first, second);
        assert_eq!(s.advance(), Advance::Wait);

        s.complete("lint", true).unwrap();
        assert_eq!(s.advance(), Advance::Wait);
        s.complete("test", true).unwrap();
        assert_eq!(s.advance(), Advance::Run("release".to_string()));
    }

    #[test]
    fn test_complete_requires_running_stage() {
        let mut s = ci(trunk());
        assert!(s.complete("test", true).is_err());
        assert!(s.complete("nope", true).is_err());
    }
}
