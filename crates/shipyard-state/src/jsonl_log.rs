//! Newline-delimited JSON deployment log.
//!
//! One record per line, appended with `O_APPEND` so concurrent runs on the
//! same host never interleave partial lines.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

/// File-backed [`DeploymentLog`].
#[derive(Debug, Clone)]
pub struct JsonlDeploymentLog {
    path: PathBuf,
}

impl JsonlDeploymentLog {
    /// Open (lazily) a log at `path`. The file and its parent directory are
    /// created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl DeploymentLog for JsonlDeploymentLog {
    async fn append(&self, record: DeploymentRecord) -> StorageResult<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&line).await.map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;

        debug!(path = %self.path.display(), record_id = %record.record_id, "appended deployment record");
        Ok(())
    }

    async fn list(&self, environment: Option<&str>) -> StorageResult<Vec<DeploymentRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DeploymentRecord =
                serde_json::from_str(line).map_err(|e| StorageError::Corrupt {
                    path: self.path.display().to_string(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            if environment.map(|env| record.environment == env).unwrap_or(true) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
