//! Shipyard-State: durable deployment history
//!
//! Every successful (or failed) rollout performed by a pipeline run leaves a
//! [`DeploymentRecord`] behind. Everything else a run produces is discarded
//! when the run ends; this crate is the one piece that outlives it.
//!
//! ## Key Components
//!
//! - `DeploymentLog`: append-only storage trait
//! - `JsonlDeploymentLog`: newline-delimited JSON file backend
//! - `fakes::MemoryDeploymentLog`: in-memory backend for tests

mod error;
pub mod fakes;
mod jsonl_log;
pub mod storage_traits;

pub use error::StorageError;
pub use jsonl_log::JsonlDeploymentLog;
pub use storage_traits::{DeploymentLog, DeploymentRecord, DeploymentResult, StorageResult};
