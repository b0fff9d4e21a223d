//! Trigger events that start a pipeline run.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of hosting-platform event started the run.
///
/// Anything that is neither a push nor a pull request is kept verbatim as
/// `Other` so it can be reported, but it never satisfies trunk or pull-request
/// checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Other(String),
}

impl From<String> for TriggerKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "push" => TriggerKind::Push,
            "pull_request" | "pull-request" | "pr" => TriggerKind::PullRequest,
            _ => TriggerKind::Other(s),
        }
    }
}

impl From<TriggerKind> for String {
    fn from(kind: TriggerKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TriggerKind {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Other(kind) => kind,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TriggerKind::from(s.to_string()))
    }
}

/// The event a pipeline run reacts to. Created once per run, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerEvent {
    #[schemars(with = "String")]
    pub trigger_kind: TriggerKind,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub is_tag: bool,
}

impl TriggerEvent {
    /// Build an event from a trigger kind and a ref, deriving `is_tag` from a
    /// `refs/tags/` prefix.
    pub fn new(trigger_kind: TriggerKind, git_ref: impl Into<String>) -> Self {
        let git_ref = git_ref.into();
        let is_tag = git_ref.starts_with("refs/tags/");
        Self {
            trigger_kind,
            git_ref,
            is_tag,
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::Push, git_ref)
    }

    pub fn pull_request(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::PullRequest, git_ref)
    }

    pub fn tag(name: impl Into<String>) -> Self {
        let name = name.into();
        let git_ref = if name.starts_with("refs/tags/") {
            name
        } else {
            format!("refs/tags/{}", name)
        };
        Self::new(TriggerKind::Push, git_ref)
    }

    /// Branch name with any `refs/heads/` prefix removed. Tags yield `None`.
    pub fn branch(&self) -> Option<&str> {
        if self.is_tag || self.git_ref.starts_with("refs/tags/") {
            return None;
        }
        Some(
            self.git_ref
                .strip_prefix("refs/heads/")
                .unwrap_or(&self.git_ref),
        )
    }
}

/// Booleans derived from a trigger event that drive fail-fast and run
/// predicates. The default (all false) is the safe classification: fail-fast
/// on, trunk-only stages skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub is_pull_request: bool,
    pub is_trunk_push: bool,
    pub is_tag: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_detected_from_ref() {
        let event = TriggerEvent::push("refs/tags/v1.2.0");
        assert!(event.is_tag);
        assert_eq!(event.branch(), None);
    }

    #[test]
    fn test_branch_strips_heads_prefix() {
        assert_eq!(TriggerEvent::push("refs/heads/main").branch(), Some("main"));
        assert_eq!(TriggerEvent::push("main").branch(), Some("main"));
    }

    #[test]
    fn test_unknown_trigger_kind_is_kept() {
        let kind: TriggerKind = "schedule".parse().unwrap();
        assert_eq!(kind, TriggerKind::Other("schedule".to_string()));
        assert_eq!(kind.to_string(), "schedule");
    }

    #[test]
    fn test_deserialize_event() {
        let event: TriggerEvent =
            serde_json::from_str(r#"{"trigger_kind":"pull_request","ref":"feature-x"}"#).unwrap();
        assert_eq!(event.trigger_kind, TriggerKind::PullRequest);
        assert!(!event.is_tag);

        let event: TriggerEvent =
            serde_json::from_str(r#"{"trigger_kind":"workflow_dispatch","ref":"main"}"#).unwrap();
        assert_eq!(
            event.trigger_kind,
            TriggerKind::Other("workflow_dispatch".to_string())
        );
    }
}
