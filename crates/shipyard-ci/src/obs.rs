//! Structured observability hooks for the pipeline lifecycle.
//!
//! Every function emits one event with a stable `event` field so log
//! pipelines can filter on it, e.g. `event=stage.finished`.

use tracing::{info, warn};

use crate::approval::ApprovalDecision;
use crate::environment::Environment;
use crate::gate::{GateKind, GateStatus};
use crate::stage::{StageKind, StageOutcome};

/// Run-scoped span. Attach with `tracing::Instrument::instrument` so it
/// follows the run future across `.await` points.
pub fn run_span(run_id: &str, branch: &str, build_id: u64) -> tracing::Span {
    tracing::info_span!("shipyard.run", run_id = %run_id, branch = %branch, build_id)
}

pub fn emit_pipeline_started(run_id: &str, environment: Environment, plan_digest: &str) {
    info!(
        event = "pipeline.started",
        run_id = %run_id,
        environment = %environment,
        plan_digest = %plan_digest,
    );
}

pub fn emit_stage_started(stage: StageKind) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: StageKind, outcome: StageOutcome, fatal: bool, duration_ms: u64) {
    if outcome == StageOutcome::Failed {
        warn!(event = "stage.finished", stage = %stage, outcome = ?outcome, fatal, duration_ms);
    } else {
        info!(event = "stage.finished", stage = %stage, outcome = ?outcome, duration_ms);
    }
}

pub fn emit_stage_skipped(stage: StageKind, environment: Environment) {
    info!(event = "stage.skipped", stage = %stage, environment = %environment);
}

pub fn emit_gate_evaluated(gate: GateKind, status: GateStatus, detail: &str) {
    info!(event = "gate.evaluated", gate = %gate, status = ?status, detail = %detail);
}

pub fn emit_approval_requested(environment: Environment, timeout_secs: u64) {
    info!(event = "approval.requested", environment = %environment, timeout_secs);
}

pub fn emit_approval_resolved(decision: ApprovalDecision, actor: Option<&str>) {
    info!(event = "approval.resolved", decision = ?decision, actor = actor.unwrap_or("-"));
}

pub fn emit_readiness_probe(resource: &str, attempt: u32, ready: bool) {
    tracing::debug!(event = "readiness.probe", resource = %resource, attempt, ready);
}

pub fn emit_deploy_recorded(environment: &str, image_reference: &str, success: bool) {
    info!(
        event = "deploy.recorded",
        environment = %environment,
        image = %image_reference,
        success,
    );
}

pub fn emit_pipeline_finished(run_id: &str, outcome: &str, duration_ms: u64, success: bool) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms,
        success,
    );
}

/// Cleanup problems are reported here and nowhere else.
pub fn emit_cleanup_error(step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cleanup.error", step = %step, error = %error);
}
