//! Trigger classification.

use trunkline_core::event::{Classification, TriggerEvent, TriggerKind};

/// Derives the policy booleans from a trigger event.
#[derive(Debug, Clone)]
pub struct TriggerClassifier {
    trunk_branch: String,
}

impl TriggerClassifier {
    pub fn new(trunk_branch: impl Into<String>) -> Self {
        let trunk_branch = trunk_branch.into();
        let trunk_branch = trunk_branch
            .strip_prefix("refs/heads/")
            .map(str::to_string)
            .unwrap_or(trunk_branch);
        Self { trunk_branch }
    }

    pub fn trunk_branch(&self) -> &str {
        &self.trunk_branch
    }

    /// Pure and total. Unrecognized trigger kinds are neither pull requests
    /// nor trunk pushes.
    pub fn classify(&self, event: &TriggerEvent) -> Classification {
        let is_tag = event.is_tag || event.git_ref.starts_with("refs/tags/");
        let is_pull_request = event.trigger_kind == TriggerKind::PullRequest;
        let is_trunk_push = event.trigger_kind == TriggerKind::Push
            && !is_tag
            && event.branch() == Some(self.trunk_branch.as_str());

        Classification {
            is_pull_request,
            is_trunk_push,
            is_tag,
        }
    }
}

impl Default for TriggerClassifier {
    fn default() -> Self {
        Self::new("main")
    }
}
