//! Manual approval before production deploys.
//!
//! The gate is a small state machine (`Pending → Approved | Aborted |
//! TimedOut`) driven by an [`ApprovalSource`]. Waiting is an ordinary
//! future bounded by `tokio::time::timeout`, so dropping it (run
//! cancellation) is the only other way out.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::environment::Environment;
use crate::error::{PipelineError, Result};

/// Input delivered by a human (or an automation acting for one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ApprovalSignal {
    Approve {
        actor: String,
    },
    Abort {
        actor: String,
        reason: Option<String>,
    },
}

/// Approval gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Aborted,
    TimedOut,
}

impl ApprovalState {
    /// Transition on a signal. Terminal states absorb further input.
    pub fn on_signal(self, signal: &ApprovalSignal) -> Self {
        match (self, signal) {
            (Self::Pending, ApprovalSignal::Approve { .. }) => Self::Approved,
            (Self::Pending, ApprovalSignal::Abort { .. }) => Self::Aborted,
            (state, _) => state,
        }
    }

    /// Transition when the wait window closes.
    pub fn on_timeout(self) -> Self {
        match self {
            Self::Pending => Self::TimedOut,
            state => state,
        }
    }
}

/// Terminal decision of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Aborted,
    TimedOut,
}

/// Audit record of one approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub requested_at: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
    pub decision: ApprovalDecision,
    /// Who decided; `None` when the window expired.
    pub actor: Option<String>,
    pub reason: Option<String>,
}

impl ApprovalRecord {
    /// Only an approved decision lets the deployer run.
    pub fn allows_deploy(&self) -> bool {
        self.decision == ApprovalDecision::Approved
    }

    /// Convert a non-approval into the matching fatal error.
    pub fn into_result(self, timeout: Duration) -> Result<ApprovalRecord> {
        match self.decision {
            ApprovalDecision::Approved => Ok(self),
            ApprovalDecision::Aborted => Err(PipelineError::ApprovalAborted {
                actor: self.actor.unwrap_or_else(|| "unknown".to_string()),
            }),
            ApprovalDecision::TimedOut => Err(PipelineError::ApprovalTimedOut {
                waited_secs: timeout.as_secs(),
            }),
        }
    }
}

/// What a reviewer is asked to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub branch: String,
    pub build_id: u64,
    pub environment: Environment,
    pub image_reference: String,
    pub requested_at: DateTime<Utc>,
}

/// Where approval signals come from.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    /// Wait for the next signal. `None` means no signal can ever arrive.
    async fn next_signal(&self, request: &ApprovalRequest) -> Option<ApprovalSignal>;
}

/// Bounded wait for a human decision.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalGate {
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for a decision, at most `timeout`.
    ///
    /// A source that closes without a signal counts as an abort.
    pub async fn await_decision(
        &self,
        source: &dyn ApprovalSource,
        request: &ApprovalRequest,
    ) -> ApprovalRecord {
        let state = ApprovalState::Pending;
        let (state, actor, reason) =
            match tokio::time::timeout(self.timeout, source.next_signal(request)).await {
                Ok(Some(signal)) => {
                    let (actor, reason) = match &signal {
                        ApprovalSignal::Approve { actor } => (actor.clone(), None),
                        ApprovalSignal::Abort { actor, reason } => (actor.clone(), reason.clone()),
                    };
                    (state.on_signal(&signal), Some(actor), reason)
                }
                Ok(None) => (
                    ApprovalState::Aborted,
                    Some("system".to_string()),
                    Some("approval source closed".to_string()),
                ),
                Err(_) => (state.on_timeout(), None, None),
            };

        let decision = match state {
            ApprovalState::Approved => ApprovalDecision::Approved,
            ApprovalState::TimedOut => ApprovalDecision::TimedOut,
            ApprovalState::Aborted | ApprovalState::Pending => ApprovalDecision::Aborted,
        };

        ApprovalRecord {
            requested_at: request.requested_at,
            decided_at: Utc::now(),
            decision,
            actor,
            reason,
        }
    }
}

/// Approval source fed through an in-process channel.
///
/// Hand out [`ApprovalHandle`]s to whatever collects human input (a prompt,
/// a webhook listener, a test).
pub struct ChannelApproval {
    inbox: Mutex<mpsc::Receiver<ApprovalSignal>>,
}

/// Sending half of a [`ChannelApproval`].
#[derive(Debug, Clone)]
pub struct ApprovalHandle {
    tx: mpsc::Sender<ApprovalSignal>,
}

impl ChannelApproval {
    pub fn channel() -> (Self, ApprovalHandle) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                inbox: Mutex::new(rx),
            },
            ApprovalHandle { tx },
        )
    }
}

impl ApprovalHandle {
    pub async fn approve(&self, actor: impl Into<String>) -> bool {
        self.send(ApprovalSignal::Approve {
            actor: actor.into(),
        })
        .await
    }

    pub async fn abort(&self, actor: impl Into<String>, reason: Option<String>) -> bool {
        self.send(ApprovalSignal::Abort {
            actor: actor.into(),
            reason,
        })
        .await
    }

    /// Returns `false` when the gate side is gone.
    pub async fn send(&self, signal: ApprovalSignal) -> bool {
        self.tx.send(signal).await.is_ok()
    }
}

#[async_trait]
impl ApprovalSource for ChannelApproval {
    async fn next_signal(&self, _request: &ApprovalRequest) -> Option<ApprovalSignal> {
        self.inbox.lock().await.recv().await
    }
}

/// Approves immediately on behalf of a fixed actor.
#[derive(Debug, Clone)]
pub struct AutoApprove {
    pub actor: String,
}

#[async_trait]
impl ApprovalSource for AutoApprove {
    async fn next_signal(&self, _request: &ApprovalRequest) -> Option<ApprovalSignal> {
        Some(ApprovalSignal::Approve {
            actor: self.actor.clone(),
        })
    }
}

/// Never answers; every request runs into the timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoApproval;

#[async_trait]
impl ApprovalSource for NoApproval {
    async fn next_signal(&self, _request: &ApprovalRequest) -> Option<ApprovalSignal> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            run_id: "run-1".into(),
            branch: "main".into(),
            build_id: 12,
            environment: Environment::Prod,
            image_reference: "db:12".into(),
            requested_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_transitions() {
        let approve = ApprovalSignal::Approve { actor: "a".into() };
        let abort = ApprovalSignal::Abort {
            actor: "b".into(),
            reason: None,
        };
        assert_eq!(ApprovalState::Pending.on_signal(&approve), ApprovalState::Approved);
        assert_eq!(ApprovalState::Pending.on_signal(&abort), ApprovalState::Aborted);
        assert_eq!(ApprovalState::Pending.on_timeout(), ApprovalState::TimedOut);
        // terminal states absorb
        assert_eq!(ApprovalState::Aborted.on_signal(&approve), ApprovalState::Aborted);
        assert_eq!(ApprovalState::Approved.on_timeout(), ApprovalState::Approved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_signal() {
        let gate = ApprovalGate::new(Duration::from_secs(30));
        let record = gate.await_decision(&NoApproval, &request()).await;
        assert_eq!(record.decision, ApprovalDecision::TimedOut);
        assert!(record.actor.is_none());
        assert!(!record.allows_deploy());

        let err = record.into_result(gate.timeout()).unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalTimedOut { waited_secs: 30 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_approve() {
        let (source, handle) = ChannelApproval::channel();
        assert!(handle.approve("release-manager").await);

        let gate = ApprovalGate::new(Duration::from_secs(30));
        let record = gate.await_decision(&source, &request()).await;
        assert_eq!(record.decision, ApprovalDecision::Approved);
        assert_eq!(record.actor.as_deref(), Some("release-manager"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_pending() {
        let (source, handle) = ChannelApproval::channel();
        let gate = ApprovalGate::new(Duration::from_secs(3600));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handle.abort("oncall", Some("freeze".into())).await;
        });

        let record = gate.await_decision(&source, &request()).await;
        assert_eq!(record.decision, ApprovalDecision::Aborted);
        assert_eq!(record.reason.as_deref(), Some("freeze"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_source_aborts() {
        let (source, handle) = ChannelApproval::channel();
        drop(handle);
        let gate = ApprovalGate::new(Duration::from_secs(30));
        let record = gate.await_decision(&source, &request()).await;
        assert_eq!(record.decision, ApprovalDecision::Aborted);
    }

    #[tokio::test]
    async fn test_auto_approve() {
        let gate = ApprovalGate::new(Duration::from_secs(1));
        let source = AutoApprove {
            actor: "ci-bot".into(),
        };
        let record = gate.await_decision(&source, &request()).await;
        assert!(record.allows_deploy());
        assert!(record.into_result(gate.timeout()).is_ok());
    }
}
