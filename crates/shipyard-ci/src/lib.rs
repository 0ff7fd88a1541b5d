//! Shipyard CI - branch-driven build, gate and promotion
//!
//! Provides a pipeline orchestrator that:
//! - Resolves a branch to a target environment and tag set
//! - Runs build, test, quality and security gates in a fixed order
//! - Holds production promotion behind a bounded human approval
//! - Pushes, deploys, records the deployment and always cleans up

pub mod approval;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod context;
pub mod deploy;
pub mod environment;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod notify;
pub mod obs;
pub mod pipeline;
pub mod readiness;
pub mod runner;
pub mod stage;
pub mod tagger;
pub mod telemetry;
pub mod trigger;

// Re-export key types
pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalHandle, ApprovalRecord, ApprovalSignal,
    ApprovalSource, AutoApprove, ChannelApproval, NoApproval,
};
pub use collaborators::{BuiltImage, Collaborators, TestResource};
pub use command::CommandToolchain;
pub use config::{PipelineConfig, PipelineSettings};
pub use context::RunContext;
pub use environment::{Environment, Resolution, Resolver, TagPolicy};
pub use error::{PipelineError, Result};
pub use gate::{GateDecision, GateKind, GateStatus, SecurityMode, SecurityPolicy, Severity};
pub use notify::{LogNotifier, Notification, Notifier, WebhookNotifier};
pub use pipeline::{FailureKind, Pipeline, PipelineOutcome, PipelineReport};
pub use readiness::ReadinessConfig;
pub use stage::{StageKind, StageOutcome, StagePlan, StageResult};
pub use tagger::{ImageTagger, TagSet};
pub use trigger::{EventKind, Trigger};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
