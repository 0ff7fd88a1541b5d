//! Inbound pipeline triggers.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Kind of source-control event that started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    /// Operator-started run; may carry no branch at all.
    Manual,
}

impl EventKind {
    /// Whether the event must name a branch to be resolvable.
    pub fn requires_branch(&self) -> bool {
        matches!(self, Self::Push | Self::PullRequest)
    }

    /// Whether runs started by this event may push or deploy.
    pub fn may_promote(&self) -> bool {
        !matches!(self, Self::PullRequest)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "push" => Ok(Self::Push),
            "pull_request" | "pr" => Ok(Self::PullRequest),
            "manual" => Ok(Self::Manual),
            other => Err(PipelineError::Configuration(format!(
                "unknown event kind: {other}"
            ))),
        }
    }
}

/// One invocation of the pipeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Branch name; absent for non-branch events.
    pub branch: Option<String>,
    /// Monotonically increasing build number.
    pub build_id: u64,
    pub event_kind: EventKind,
}

impl Trigger {
    pub fn new(branch: Option<String>, build_id: u64, event_kind: EventKind) -> Self {
        Self {
            branch,
            build_id,
            event_kind,
        }
    }

    /// Push event on `branch`.
    pub fn push(branch: impl Into<String>, build_id: u64) -> Self {
        Self::new(Some(branch.into()), build_id, EventKind::Push)
    }

    /// Branch name with blank values treated as absent.
    pub fn branch_name(&self) -> Option<&str> {
        self.branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
    }

    /// Branch label for logs and notifications.
    pub fn branch_label(&self) -> &str {
        self.branch_name().unwrap_or("<none>")
    }
}
