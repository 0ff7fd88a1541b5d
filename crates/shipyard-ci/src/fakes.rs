//! Scripted collaborators for tests (testing only)
//!
//! `ScriptedToolchain` plays every collaborator role with configurable
//! failures and counts what it was asked to do. `RecordingNotifier` keeps
//! every notification it receives.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collaborators::{
    BuiltImage, Deployer, HealthCheck, ImageBuilder, QualityScanner, Registry, SecurityScanner,
    SourceBuilder, TestResource, TestResources, TestSuite,
};
use crate::context::RunContext;
use crate::environment::Environment;
use crate::gate::{CheckStatus, QualityReport, SecurityReport, Severity};
use crate::notify::{Notification, Notifier};
use crate::stage::StageKind;
use crate::tagger::TagSet;

/// How the test database answers readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBehavior {
    Ready,
    /// Ready from the given 1-based probe attempt onwards.
    ReadyAfter(usize),
    NeverReady,
}

#[derive(Debug, Default)]
struct Counters {
    builds: AtomicUsize,
    starts: AtomicUsize,
    releases: AtomicUsize,
    probes: AtomicUsize,
    test_runs: AtomicUsize,
    quality_scans: AtomicUsize,
    image_builds: AtomicUsize,
    security_scans: AtomicUsize,
}

/// Collaborator stub for every stage.
#[derive(Debug)]
pub struct ScriptedToolchain {
    failing: HashSet<StageKind>,
    hanging: HashSet<StageKind>,
    db: DbBehavior,
    quality: QualityReport,
    security: SecurityReport,
    counters: Counters,
    pushed: Mutex<Vec<(String, String)>>,
    deployed: Mutex<Vec<(Environment, String)>>,
    scanned_severities: Mutex<Vec<Severity>>,
}

impl Default for ScriptedToolchain {
    fn default() -> Self {
        Self {
            failing: HashSet::new(),
            hanging: HashSet::new(),
            db: DbBehavior::Ready,
            quality: QualityReport::default().with_check("coverage", CheckStatus::Ok),
            security: SecurityReport::default(),
            counters: Counters::default(),
            pushed: Mutex::new(Vec::new()),
            deployed: Mutex::new(Vec::new()),
            scanned_severities: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedToolchain {
    /// Everything passes; quality is OK and the image has no findings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The collaborator behind `stage` returns an error.
    pub fn failing(mut self, stage: StageKind) -> Self {
        self.failing.insert(stage);
        self
    }

    /// The collaborator behind `stage` never returns.
    pub fn hanging(mut self, stage: StageKind) -> Self {
        self.hanging.insert(stage);
        self
    }

    pub fn with_db(mut self, db: DbBehavior) -> Self {
        self.db = db;
        self
    }

    pub fn with_quality(mut self, report: QualityReport) -> Self {
        self.quality = report;
        self
    }

    pub fn with_security(mut self, report: SecurityReport) -> Self {
        self.security = report;
        self
    }

    async fn step(&self, stage: StageKind) -> anyhow::Result<()> {
        if self.hanging.contains(&stage) {
            futures::future::pending::<()>().await;
        }
        if self.failing.contains(&stage) {
            anyhow::bail!("scripted {stage} failure");
        }
        Ok(())
    }

    pub fn builds(&self) -> usize {
        self.counters.builds.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.counters.probes.load(Ordering::SeqCst)
    }

    pub fn test_runs(&self) -> usize {
        self.counters.test_runs.load(Ordering::SeqCst)
    }

    pub fn quality_scans(&self) -> usize {
        self.counters.quality_scans.load(Ordering::SeqCst)
    }

    pub fn image_builds(&self) -> usize {
        self.counters.image_builds.load(Ordering::SeqCst)
    }

    pub fn security_scans(&self) -> usize {
        self.counters.security_scans.load(Ordering::SeqCst)
    }

    /// `(image_reference, tag)` pairs pushed, in order.
    pub fn pushed(&self) -> Vec<(String, String)> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn pushed_tags(&self) -> Vec<String> {
        self.pushed().into_iter().map(|(_, tag)| tag).collect()
    }

    /// `(environment, image_reference)` pairs deployed, in order.
    pub fn deployed(&self) -> Vec<(Environment, String)> {
        self.deployed.lock().unwrap().clone()
    }

    pub fn deploys(&self) -> usize {
        self.deployed.lock().unwrap().len()
    }

    /// Severity filter passed to the last security scan.
    pub fn scanned_severities(&self) -> Vec<Severity> {
        self.scanned_severities.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceBuilder for ScriptedToolchain {
    async fn build(&self, _ctx: &RunContext) -> anyhow::Result<()> {
        self.counters.builds.fetch_add(1, Ordering::SeqCst);
        self.step(StageKind::Build).await
    }
}

#[async_trait]
impl TestResources for ScriptedToolchain {
    async fn start(&self, ctx: &RunContext) -> anyhow::Result<TestResource> {
        let n = self.counters.starts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestResource {
            id: format!("db-{}-{n}", ctx.build_id()),
        })
    }

    async fn release(&self, _resource: &TestResource) -> anyhow::Result<()> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for ScriptedToolchain {
    async fn probe(&self, _resource: &TestResource) -> anyhow::Result<bool> {
        let attempt = self.counters.probes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match self.db {
            DbBehavior::Ready => true,
            DbBehavior::ReadyAfter(n) => attempt >= n,
            DbBehavior::NeverReady => false,
        })
    }
}

#[async_trait]
impl TestSuite for ScriptedToolchain {
    async fn run_tests(&self, _ctx: &RunContext, _resource: &TestResource) -> anyhow::Result<()> {
        self.counters.test_runs.fetch_add(1, Ordering::SeqCst);
        self.step(StageKind::Test).await
    }
}

#[async_trait]
impl QualityScanner for ScriptedToolchain {
    async fn scan_source(&self, _ctx: &RunContext) -> anyhow::Result<QualityReport> {
        self.counters.quality_scans.fetch_add(1, Ordering::SeqCst);
        self.step(StageKind::QualityGate).await?;
        Ok(self.quality.clone())
    }
}

#[async_trait]
impl ImageBuilder for ScriptedToolchain {
    async fn build_image(&self, ctx: &RunContext) -> anyhow::Result<BuiltImage> {
        self.counters.image_builds.fetch_add(1, Ordering::SeqCst);
        self.step(StageKind::ImageBuild).await?;
        Ok(BuiltImage {
            reference: ctx.build_reference(),
            health_check: Some("pg_isready".to_string()),
            exposed_port: Some(5432),
        })
    }
}

#[async_trait]
impl SecurityScanner for ScriptedToolchain {
    async fn scan_image(
        &self,
        _image: &BuiltImage,
        severities: &[Severity],
    ) -> anyhow::Result<SecurityReport> {
        self.counters.security_scans.fetch_add(1, Ordering::SeqCst);
        *self.scanned_severities.lock().unwrap() = severities.to_vec();
        self.step(StageKind::SecurityScan).await?;
        Ok(self.security.clone())
    }
}

#[async_trait]
impl Registry for ScriptedToolchain {
    async fn push(&self, image_reference: &str, tag: &str) -> anyhow::Result<()> {
        self.step(StageKind::Push).await?;
        self.pushed
            .lock()
            .unwrap()
            .push((image_reference.to_string(), tag.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Deployer for ScriptedToolchain {
    async fn deploy(
        &self,
        environment: Environment,
        image_reference: &str,
        _tags: &TagSet,
    ) -> anyhow::Result<()> {
        self.step(StageKind::Deploy).await?;
        self.deployed
            .lock()
            .unwrap()
            .push((environment, image_reference.to_string()));
        Ok(())
    }
}

/// Notifier that keeps every notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records, then reports delivery failure.
    pub fn failing() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Notification> {
        self.received.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(notification.clone());
        if self.fail {
            anyhow::bail!("notification channel unavailable");
        }
        Ok(())
    }
}
