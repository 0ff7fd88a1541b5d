//! Storage trait definitions for deployment history.
//!
//! The log is append-only: records are never rewritten or removed, and
//! `list` always returns them in the order they were appended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result of the rollout action recorded in a [`DeploymentRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentResult {
    Succeeded,
    Failed { error: String },
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One rollout of an image into an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique identifier for this record
    pub record_id: Uuid,
    /// Pipeline run that performed the rollout
    pub run_id: String,
    /// Target environment name (`dev`, `staging`, `prod`)
    pub environment: String,
    /// Image reference that was rolled out (build-number tag)
    pub image_reference: String,
    /// Every registry tag applied to the image for this build
    pub tags: Vec<String>,
    /// Branch the build came from
    pub branch: String,
    /// Build identifier of the run
    pub build_id: u64,
    /// When the rollout finished
    pub timestamp: DateTime<Utc>,
    pub result: DeploymentResult,
}

impl DeploymentRecord {
    /// Create a record stamped with the current time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        environment: impl Into<String>,
        image_reference: impl Into<String>,
        tags: Vec<String>,
        branch: impl Into<String>,
        build_id: u64,
        result: DeploymentResult,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            run_id: run_id.into(),
            environment: environment.into(),
            image_reference: image_reference.into(),
            tags,
            branch: branch.into(),
            build_id,
            timestamp: Utc::now(),
            result,
        }
    }
}

/// Append-only deployment history.
///
/// Guarantees:
/// - `append` never modifies or drops earlier records.
/// - `list` returns records oldest first, optionally filtered by environment.
/// - `latest` returns the most recently appended record for an environment.
#[async_trait]
pub trait DeploymentLog: Send + Sync {
    /// Append a record to the log.
    async fn append(&self, record: DeploymentRecord) -> StorageResult<()>;

    /// List records (oldest first), filtered by environment when given.
    async fn list(&self, environment: Option<&str>) -> StorageResult<Vec<DeploymentRecord>>;

    /// Most recent record for an environment, if any.
    async fn latest(&self, environment: &str) -> StorageResult<Option<DeploymentRecord>> {
        Ok(self.list(Some(environment)).await?.pop())
    }
}
