//! Cleanup and terminal notification.
//!
//! Runs once after the sequencer halts, whatever happened. Nothing in here
//! can change the reported outcome of a run: errors are logged and counted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::{TestResource, TestResources};
use crate::environment::Environment;
use crate::gate::GateDecision;
use crate::obs;
use crate::stage::{StageKind, StageResult};

/// Terminal message describing a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub run_id: String,
    pub branch: String,
    pub build_id: u64,
    pub environment: Environment,
    pub success: bool,
    /// Short outcome label (`succeeded`, `gate_blocked`, ...).
    pub outcome: String,
    /// Stage where the fatal failure occurred, if any.
    pub failed_stage: Option<StageKind>,
    pub message: Option<String>,
    pub stages: Vec<StageResult>,
    pub gates: Vec<GateDecision>,
    pub plan_digest: Option<String>,
}

impl Notification {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        let status = if self.success { "SUCCESS" } else { "FAILURE" };
        let mut line = format!(
            "{status}: build {} on {} ({})",
            self.build_id, self.branch, self.environment
        );
        if let Some(stage) = self.failed_stage {
            line.push_str(&format!(" failed at {stage}"));
        }
        if let Some(message) = &self.message {
            line.push_str(&format!(": {message}"));
        }
        line
    }
}

/// Outcome notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes the notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        if notification.success {
            info!(event = "pipeline.notification", summary = %notification.summary());
        } else {
            warn!(event = "pipeline.notification", summary = %notification.summary());
        }
        Ok(())
    }
}

/// POSTs the notification as JSON.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// What cleanup managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub released: usize,
    pub release_errors: Vec<String>,
    pub notified: usize,
    pub notify_errors: Vec<String>,
}

/// Release held resources, then deliver the notification to every notifier.
pub async fn run_cleanup(
    resources: &dyn TestResources,
    held: &[TestResource],
    notifiers: &[Arc<dyn Notifier>],
    notification: &Notification,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for resource in held {
        match resources.release(resource).await {
            Ok(()) => report.released += 1,
            Err(e) => {
                obs::emit_cleanup_error("release", &format!("{}: {e:#}", resource.id));
                report.release_errors.push(format!("{}: {e:#}", resource.id));
            }
        }
    }

    for notifier in notifiers {
        match notifier.notify(notification).await {
            Ok(()) => report.notified += 1,
            Err(e) => {
                obs::emit_cleanup_error("notify", &format!("{e:#}"));
                report.notify_errors.push(format!("{e:#}"));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::stage::StageOutcome;

    fn notification(success: bool) -> Notification {
        Notification {
            run_id: "run-1".into(),
            branch: "release/1.2".into(),
            build_id: 31,
            environment: Environment::Staging,
            success,
            outcome: if success { "succeeded" } else { "gate_blocked" }.into(),
            failed_stage: (!success).then_some(StageKind::SecurityScan),
            message: (!success).then(|| "security gate blocked: 1 critical".to_string()),
            stages: vec![StageResult {
                name: StageKind::Build,
                outcome: StageOutcome::Passed,
                blocking: true,
                detail: None,
                duration_ms: 3,
            }],
            gates: vec![],
            plan_digest: None,
        }
    }

    struct FailingResources;

    #[async_trait]
    impl TestResources for FailingResources {
        async fn start(&self, _ctx: &RunContext) -> anyhow::Result<TestResource> {
            anyhow::bail!("unused")
        }

        async fn release(&self, _resource: &TestResource) -> anyhow::Result<()> {
            anyhow::bail!("container already gone")
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _notification: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("webhook unreachable")
        }
    }

    #[test]
    fn test_summary_names_failed_stage() {
        let summary = notification(false).summary();
        assert!(summary.starts_with("FAILURE: build 31 on release/1.2 (staging)"));
        assert!(summary.contains("failed at security_scan"));

        assert_eq!(
            notification(true).summary(),
            "SUCCESS: build 31 on release/1.2 (staging)"
        );
    }

    #[tokio::test]
    async fn test_cleanup_swallows_errors() {
        let held = vec![TestResource { id: "db-1".into() }];
        let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(FailingNotifier), Arc::new(LogNotifier)];
        let report = run_cleanup(&FailingResources, &held, &notifiers, &notification(false)).await;

        assert_eq!(report.released, 0);
        assert_eq!(report.release_errors.len(), 1);
        assert_eq!(report.notified, 1);
        assert_eq!(report.notify_errors, vec!["webhook unreachable".to_string()]);
    }
}
