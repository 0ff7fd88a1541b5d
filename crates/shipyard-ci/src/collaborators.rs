//! Seams to the external tools a run drives.
//!
//! The orchestrator only consumes pass/fail signals and artifact identities
//! from these; what the tools actually do (SQL, Dockerfiles, scanners) is
//! their own business.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::environment::Environment;
use crate::gate::{QualityReport, SecurityReport, Severity};
use crate::tagger::TagSet;

/// Image produced by the artifact build collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    /// Reference carrying the build-number tag.
    pub reference: String,
    /// Image health-check command declared by the image, if any.
    pub health_check: Option<String>,
    pub exposed_port: Option<u16>,
}

/// Handle to a transient resource started for integration testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResource {
    pub id: String,
}

/// Build stage: validate and assemble the build context.
#[async_trait]
pub trait SourceBuilder: Send + Sync {
    async fn build(&self, ctx: &RunContext) -> anyhow::Result<()>;
}

/// Transient dependencies for integration tests (e.g. a database instance).
#[async_trait]
pub trait TestResources: Send + Sync {
    async fn start(&self, ctx: &RunContext) -> anyhow::Result<TestResource>;

    async fn release(&self, resource: &TestResource) -> anyhow::Result<()>;
}

/// Readiness probe: `Ok(true)` only when the service accepts connections
/// and a trivial query succeeds.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn probe(&self, resource: &TestResource) -> anyhow::Result<bool>;
}

/// Integration test suite run against a ready resource.
#[async_trait]
pub trait TestSuite: Send + Sync {
    async fn run_tests(&self, ctx: &RunContext, resource: &TestResource) -> anyhow::Result<()>;
}

#[async_trait]
pub trait QualityScanner: Send + Sync {
    async fn scan_source(&self, ctx: &RunContext) -> anyhow::Result<QualityReport>;
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(&self, ctx: &RunContext) -> anyhow::Result<BuiltImage>;
}

#[async_trait]
pub trait SecurityScanner: Send + Sync {
    async fn scan_image(
        &self,
        image: &BuiltImage,
        severities: &[Severity],
    ) -> anyhow::Result<SecurityReport>;
}

/// Image registry. Tags are plain strings with no wildcard semantics.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn push(&self, image_reference: &str, tag: &str) -> anyhow::Result<()>;
}

/// Environment-specific rollout action.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        environment: Environment,
        image_reference: &str,
        tags: &TagSet,
    ) -> anyhow::Result<()>;
}

/// Every collaborator a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceBuilder>,
    pub resources: Arc<dyn TestResources>,
    pub health: Arc<dyn HealthCheck>,
    pub tests: Arc<dyn TestSuite>,
    pub quality: Arc<dyn QualityScanner>,
    pub images: Arc<dyn ImageBuilder>,
    pub security: Arc<dyn SecurityScanner>,
    pub registry: Arc<dyn Registry>,
    pub deployer: Arc<dyn Deployer>,
}

impl Collaborators {
    /// Use one value for every collaborator role.
    pub fn shared<T>(toolchain: Arc<T>) -> Self
    where
        T: SourceBuilder
            + TestResources
            + HealthCheck
            + TestSuite
            + QualityScanner
            + ImageBuilder
            + SecurityScanner
            + Registry
            + Deployer
            + 'static,
    {
        Self {
            source: toolchain.clone(),
            resources: toolchain.clone(),
            health: toolchain.clone(),
            tests: toolchain.clone(),
            quality: toolchain.clone(),
            images: toolchain.clone(),
            security: toolchain.clone(),
            registry: toolchain.clone(),
            deployer: toolchain,
        }
    }
}
