//! Bounded readiness polling for transient test dependencies.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::collaborators::{HealthCheck, TestResource};
use crate::obs;

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Pause between attempts.
    pub interval: Duration,
    /// Hard bound on the whole wait.
    pub timeout: Duration,
    /// Bound on a single probe invocation.
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready {
        attempts: u32,
        waited: Duration,
    },
    NotReady {
        attempts: u32,
        waited: Duration,
        last_error: Option<String>,
    },
}

/// Poll `probe` every `interval` until it reports ready or `timeout` elapses.
///
/// Never blocks longer than `config.timeout`; a hung probe is cut off after
/// `probe_timeout` and counts as a failed attempt.
pub async fn wait_until_ready(
    probe: &dyn HealthCheck,
    resource: &TestResource,
    config: &ReadinessConfig,
) -> Readiness {
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;

    let polled = tokio::time::timeout(config.timeout, async {
        loop {
            attempts += 1;
            match tokio::time::timeout(config.probe_timeout, probe.probe(resource)).await {
                Ok(Ok(true)) => {
                    obs::emit_readiness_probe(&resource.id, attempts, true);
                    return;
                }
                Ok(Ok(false)) => last_error = Some("not ready".to_string()),
                Ok(Err(e)) => last_error = Some(format!("{e:#}")),
                Err(_) => {
                    last_error = Some(format!(
                        "probe timed out after {}s",
                        config.probe_timeout.as_secs()
                    ))
                }
            }
            obs::emit_readiness_probe(&resource.id, attempts, false);
            tokio::time::sleep(config.interval).await;
        }
    })
    .await;

    let waited = started.elapsed();
    match polled {
        Ok(()) => Readiness::Ready { attempts, waited },
        Err(_) => Readiness::NotReady {
            attempts,
            waited,
            last_error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Becomes ready on the n-th probe (never when `ready_on == 0`).
    struct CountingProbe {
        ready_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthCheck for CountingProbe {
        async fn probe(&self, _resource: &TestResource) -> anyhow::Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.ready_on != 0 && n >= self.ready_on)
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthCheck for HangingProbe {
        async fn probe(&self, _resource: &TestResource) -> anyhow::Result<bool> {
            std::future::pending().await
        }
    }

    fn resource() -> TestResource {
        TestResource { id: "db-1".into() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_attempts() {
        let probe = CountingProbe {
            ready_on: 3,
            calls: AtomicU32::new(0),
        };
        let readiness = wait_until_ready(&probe, &resource(), &ReadinessConfig::default()).await;
        match readiness {
            Readiness::Ready { attempts, waited } => {
                assert_eq!(attempts, 3);
                assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(5));
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_gives_up_at_timeout() {
        let probe = CountingProbe {
            ready_on: 0,
            calls: AtomicU32::new(0),
        };
        let config = ReadinessConfig {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(1),
        };
        let readiness = wait_until_ready(&probe, &resource(), &config).await;
        match readiness {
            Readiness::NotReady {
                attempts,
                waited,
                last_error,
            } => {
                assert!(attempts >= 5);
                assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
                assert_eq!(last_error.as_deref(), Some("not ready"));
            }
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_is_cut_off() {
        let config = ReadinessConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        };
        let readiness = wait_until_ready(&HangingProbe, &resource(), &config).await;
        match readiness {
            Readiness::NotReady { last_error, .. } => {
                assert!(last_error.unwrap().contains("probe timed out"));
            }
            other => panic!("expected NotReady, got {other:?}"),
        }
    }
}
