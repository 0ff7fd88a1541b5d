//! Error taxonomy for pipeline runs.

use crate::gate::GateKind;
use crate::stage::StageKind;

/// Errors that end (or would end) a pipeline run.
///
/// Only `StageFailure` can be downgraded to advisory, and only for stages
/// declared advisory. Every other variant is always fatal.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("stage {stage} failed: {reason}")]
    StageFailure { stage: StageKind, reason: String },

    #[error("{gate} gate blocked: {detail}")]
    GateBlock { gate: GateKind, detail: String },

    #[error("approval aborted by {actor}")]
    ApprovalAborted { actor: String },

    #[error("approval timed out after {waited_secs}s")]
    ApprovalTimedOut { waited_secs: u64 },

    #[error("deploy failed: {0}")]
    DeployFailure(String),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether an advisory stage may record this error and carry on.
    pub fn is_downgradable(&self) -> bool {
        matches!(self, Self::StageFailure { .. })
    }

    pub(crate) fn stage(stage: StageKind, reason: impl std::fmt::Display) -> Self {
        Self::StageFailure {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
