//! In-memory fakes for storage traits (testing only)

use std::sync::Mutex;

use async_trait::async_trait;

use crate::storage_traits::*;

/// In-memory deployment log backed by a `Vec<DeploymentRecord>`.
#[derive(Debug, Default)]
pub struct MemoryDeploymentLog {
    records: Mutex<Vec<DeploymentRecord>>,
}

impl MemoryDeploymentLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeploymentLog for MemoryDeploymentLog {
    async fn append(&self, record: DeploymentRecord) -> StorageResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn list(&self, environment: Option<&str>) -> StorageResult<Vec<DeploymentRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| environment.map(|e| r.environment == e).unwrap_or(true))
            .cloned()
            .collect())
    }
}
