//! Pipeline orchestration: resolve → sequence stages → cleanup/notify.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::{AbortRegistration, Abortable};
use serde::{Deserialize, Serialize};
use shipyard_state::{DeploymentLog, DeploymentRecord};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::approval::{ApprovalGate, ApprovalRecord, ApprovalRequest, ApprovalSource, NoApproval};
use crate::collaborators::{BuiltImage, Collaborators, TestResource};
use crate::config::PipelineSettings;
use crate::context::RunContext;
use crate::deploy::DeployRunner;
use crate::environment::{Environment, Resolver};
use crate::error::{PipelineError, Result};
use crate::gate::{GateDecision, GateStatus, QualityGate, SecurityGate};
use crate::notify::{run_cleanup, CleanupReport, LogNotifier, Notification, Notifier};
use crate::obs;
use crate::readiness::{wait_until_ready, Readiness};
use crate::stage::{StageDecl, StageKind, StageOutcome, StageResult};
use crate::tagger::TagSet;
use crate::trigger::Trigger;

/// Category of a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Stage,
    GateBlock,
    ApprovalAborted,
    ApprovalTimedOut,
    Deploy,
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Succeeded,
    /// Nothing ran: the trigger or configuration could not be resolved.
    ConfigurationError { message: String },
    Failed {
        stage: StageKind,
        kind: FailureKind,
        message: String,
    },
    Cancelled { stage: Option<StageKind> },
}

impl PipelineOutcome {
    fn from_error(stage: StageKind, err: &PipelineError) -> Self {
        let kind = match err {
            PipelineError::GateBlock { .. } => FailureKind::GateBlock,
            PipelineError::ApprovalAborted { .. } => FailureKind::ApprovalAborted,
            PipelineError::ApprovalTimedOut { .. } => FailureKind::ApprovalTimedOut,
            PipelineError::DeployFailure(_) => FailureKind::Deploy,
            PipelineError::Cancelled => return Self::Cancelled { stage: Some(stage) },
            PipelineError::Configuration(message) => {
                return Self::ConfigurationError {
                    message: message.clone(),
                }
            }
            _ => FailureKind::Stage,
        };
        Self::Failed {
            stage,
            kind,
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::Failed { stage, .. } => Some(*stage),
            Self::Cancelled { stage } => *stage,
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::ConfigurationError { .. } => "configuration_error",
            Self::Failed { kind, .. } => match kind {
                FailureKind::Stage => "stage_failed",
                FailureKind::GateBlock => "gate_blocked",
                FailureKind::ApprovalAborted => "approval_aborted",
                FailureKind::ApprovalTimedOut => "approval_timed_out",
                FailureKind::Deploy => "deploy_failed",
            },
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Self::Succeeded => None,
            Self::ConfigurationError { message } => Some(message.clone()),
            Self::Failed { message, .. } => Some(message.clone()),
            Self::Cancelled { .. } => Some("run cancelled".to_string()),
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::ConfigurationError { .. } => 2,
            Self::Failed { kind, .. } => match kind {
                FailureKind::Stage => 1,
                FailureKind::GateBlock => 3,
                FailureKind::ApprovalAborted | FailureKind::ApprovalTimedOut => 4,
                FailureKind::Deploy => 5,
            },
            Self::Cancelled { .. } => 130,
        }
    }
}

/// Audit trail of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub trigger: Trigger,
    pub environment: Environment,
    pub tags: Option<TagSet>,
    pub plan_digest: Option<String>,
    pub outcome: PipelineOutcome,
    /// Ordered stage results.
    pub stages: Vec<StageResult>,
    pub gates: Vec<GateDecision>,
    pub approval: Option<ApprovalRecord>,
    pub deployment: Option<DeploymentRecord>,
    pub cleanup: CleanupReport,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == kind)
    }

    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.failed()).count()
    }

    fn notification(&self) -> Notification {
        Notification {
            run_id: self.run_id.clone(),
            branch: self.trigger.branch_label().to_string(),
            build_id: self.trigger.build_id,
            environment: self.environment,
            success: self.success(),
            outcome: self.outcome.label().to_string(),
            failed_stage: self.outcome.failed_stage(),
            message: self.outcome.message(),
            stages: self.stages.clone(),
            gates: self.gates.clone(),
            plan_digest: self.plan_digest.clone(),
        }
    }
}

/// Mutable state of a run in progress. Stage outputs land here; the
/// context itself never changes.
#[derive(Default)]
struct RunState {
    results: Vec<StageResult>,
    current: Option<StageKind>,
    held: Vec<TestResource>,
    image: Option<BuiltImage>,
    gates: Vec<GateDecision>,
    approval: Option<ApprovalRecord>,
    deployment: Option<DeploymentRecord>,
}

/// The promotion pipeline.
pub struct Pipeline {
    settings: PipelineSettings,
    resolver: Resolver,
    collaborators: Collaborators,
    approvals: Arc<dyn ApprovalSource>,
    log: Arc<dyn DeploymentLog>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Pipeline {
    /// Pipeline with the standard resolver, no approval source (prod runs
    /// time out at the approval gate) and a log notifier.
    pub fn new(
        settings: PipelineSettings,
        collaborators: Collaborators,
        log: Arc<dyn DeploymentLog>,
    ) -> Self {
        Self {
            settings,
            resolver: Resolver::standard(),
            collaborators,
            approvals: Arc::new(NoApproval),
            log,
            notifiers: vec![Arc::new(LogNotifier)],
        }
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalSource>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Run the pipeline for a trigger. Always returns a report; failures
    /// are described by its outcome.
    pub async fn run(&self, trigger: Trigger) -> PipelineReport {
        self.run_inner(trigger, None).await
    }

    /// Like [`Pipeline::run`], but the stage sequence stops when the paired
    /// `AbortHandle` fires. Cleanup still runs.
    pub async fn run_cancellable(
        &self,
        trigger: Trigger,
        registration: AbortRegistration,
    ) -> PipelineReport {
        self.run_inner(trigger, Some(registration)).await
    }

    async fn run_inner(
        &self,
        trigger: Trigger,
        registration: Option<AbortRegistration>,
    ) -> PipelineReport {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, trigger.branch_label(), trigger.build_id);
        self.execute(run_id, trigger, registration)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: String,
        trigger: Trigger,
        registration: Option<AbortRegistration>,
    ) -> PipelineReport {
        let start = Instant::now();
        let mut state = RunState::default();

        let (ctx, outcome) = match self.resolver.resolve(&trigger) {
            Err(err) => {
                let outcome = PipelineOutcome::ConfigurationError {
                    message: err.to_string(),
                };
                (None, outcome)
            }
            Ok(resolution) => {
                let ctx = RunContext::new(
                    run_id.clone(),
                    trigger.clone(),
                    &resolution,
                    self.settings.tagger.clone(),
                    &self.settings.plan,
                    self.settings.build_context.clone(),
                );
                obs::emit_pipeline_started(&run_id, ctx.environment, &ctx.plan_digest);

                let sequence = self.sequence(&ctx, &mut state);
                let halted = match registration {
                    Some(reg) => Abortable::new(sequence, reg).await,
                    None => Ok(sequence.await),
                };

                let outcome = match halted {
                    Ok(Ok(())) => PipelineOutcome::Succeeded,
                    Ok(Err((stage, err))) => PipelineOutcome::from_error(stage, &err),
                    Err(_aborted) => {
                        let stage = state.current.take();
                        if let Some(kind) = stage {
                            state.results.push(StageResult {
                                name: kind,
                                outcome: StageOutcome::Failed,
                                blocking: true,
                                detail: Some("cancelled".to_string()),
                                duration_ms: 0,
                            });
                        }
                        PipelineOutcome::Cancelled { stage }
                    }
                };
                (Some(ctx), outcome)
            }
        };

        let mut report = PipelineReport {
            run_id,
            environment: ctx
                .as_ref()
                .map(|c| c.environment)
                .unwrap_or(Environment::None),
            tags: ctx.as_ref().map(|c| c.tags.clone()),
            plan_digest: ctx.as_ref().map(|c| c.plan_digest.clone()),
            trigger,
            outcome,
            stages: std::mem::take(&mut state.results),
            gates: std::mem::take(&mut state.gates),
            approval: state.approval.take(),
            deployment: state.deployment.take(),
            cleanup: CleanupReport::default(),
            duration_ms: 0,
        };

        let notification = report.notification();
        report.cleanup = run_cleanup(
            self.collaborators.resources.as_ref(),
            &state.held,
            &self.notifiers,
            &notification,
        )
        .await;

        report.duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_pipeline_finished(
            &report.run_id,
            report.outcome.label(),
            report.duration_ms,
            report.success(),
        );
        report
    }

    /// Walk the stage plan. Returns the first fatal failure.
    async fn sequence(
        &self,
        ctx: &RunContext,
        state: &mut RunState,
    ) -> std::result::Result<(), (StageKind, PipelineError)> {
        for decl in self.settings.plan.stages() {
            if !decl.applicability.applies(ctx.environment) {
                obs::emit_stage_skipped(decl.kind, ctx.environment);
                state.results.push(StageResult::skipped(decl));
                continue;
            }

            obs::emit_stage_started(decl.kind);
            state.current = Some(decl.kind);
            let started = Instant::now();
            let result = self.run_stage(decl, ctx, state).await;
            state.current = None;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(detail) => {
                    obs::emit_stage_finished(
                        decl.kind,
                        StageOutcome::Passed,
                        decl.fatal,
                        duration_ms,
                    );
                    state.results.push(StageResult {
                        name: decl.kind,
                        outcome: StageOutcome::Passed,
                        blocking: decl.fatal,
                        detail,
                        duration_ms,
                    });
                }
                Err(err) => {
                    let halts = decl.fatal || !err.is_downgradable();
                    obs::emit_stage_finished(
                        decl.kind,
                        StageOutcome::Failed,
                        halts,
                        duration_ms,
                    );
                    state.results.push(StageResult {
                        name: decl.kind,
                        outcome: StageOutcome::Failed,
                        blocking: halts,
                        detail: Some(err.to_string()),
                        duration_ms,
                    });
                    if halts {
                        return Err((decl.kind, err));
                    }
                    info!(stage = %decl.kind, error = %err, "advisory stage failed, continuing");
                }
            }
        }
        Ok(())
    }

    /// Execute one stage. `Ok(detail)` on success.
    async fn run_stage(
        &self,
        decl: &StageDecl,
        ctx: &RunContext,
        state: &mut RunState,
    ) -> Result<Option<String>> {
        let stage = decl.kind;
        let c = &self.collaborators;
        match stage {
            StageKind::Build => {
                c.source
                    .build(ctx)
                    .await
                    .map_err(|e| PipelineError::stage(stage, format!("{e:#}")))?;
                Ok(None)
            }
            StageKind::Test => {
                let resource = c
                    .resources
                    .start(ctx)
                    .await
                    .map_err(|e| PipelineError::stage(stage, format!("test resources: {e:#}")))?;
                state.held.push(resource.clone());

                match wait_until_ready(c.health.as_ref(), &resource, &self.settings.readiness).await {
                    Readiness::Ready { attempts, .. } => {
                        tracing::debug!(resource = %resource.id, attempts, "test resource ready");
                    }
                    Readiness::NotReady {
                        attempts,
                        last_error,
                        ..
                    } => {
                        return Err(PipelineError::stage(
                            stage,
                            format!(
                                "test resource {} not ready after {} attempt(s) in {}s: {}",
                                resource.id,
                                attempts,
                                self.settings.readiness.timeout.as_secs(),
                                last_error.unwrap_or_else(|| "no probe completed".to_string()),
                            ),
                        ));
                    }
                }

                c.tests
                    .run_tests(ctx, &resource)
                    .await
                    .map_err(|e| PipelineError::stage(stage, format!("{e:#}")))?;
                Ok(None)
            }
            StageKind::QualityGate => {
                let timeout = self.settings.quality_timeout;
                let decision = match tokio::time::timeout(timeout, c.quality.scan_source(ctx)).await {
                    Ok(Ok(report)) => QualityGate::evaluate(&report),
                    Ok(Err(e)) => return Err(PipelineError::stage(stage, format!("{e:#}"))),
                    Err(_) => QualityGate::not_ready(timeout.as_secs()),
                };
                self.record_gate(state, decision)
            }
            StageKind::ImageBuild => {
                let image = c
                    .images
                    .build_image(ctx)
                    .await
                    .map_err(|e| PipelineError::stage(stage, format!("{e:#}")))?;
                let detail = image.reference.clone();
                state.image = Some(image);
                Ok(Some(detail))
            }
            StageKind::SecurityScan => {
                let image = built_image(state, stage)?;
                let report = c
                    .security
                    .scan_image(&image, &self.settings.severities)
                    .await
                    .map_err(|e| PipelineError::stage(stage, format!("{e:#}")))?;
                let decision = SecurityGate::new(self.settings.security.clone()).evaluate(&report);
                self.record_gate(state, decision)
            }
            StageKind::ApprovalGate => {
                let image = built_image(state, stage)?;
                let gate = ApprovalGate::new(self.settings.approval_timeout);
                let request = ApprovalRequest {
                    run_id: ctx.run_id.clone(),
                    branch: ctx.branch().to_string(),
                    build_id: ctx.build_id(),
                    environment: ctx.environment,
                    image_reference: image.reference,
                    requested_at: Utc::now(),
                };
                obs::emit_approval_requested(ctx.environment, gate.timeout().as_secs());
                let record = gate.await_decision(self.approvals.as_ref(), &request).await;
                obs::emit_approval_resolved(record.decision, record.actor.as_deref());
                state.approval = Some(record.clone());
                let record = record.into_result(gate.timeout())?;
                Ok(record.actor.map(|a| format!("approved by {a}")))
            }
            StageKind::Push => {
                let image = built_image(state, stage)?;
                for tag in ctx.tags.iter() {
                    c.registry.push(&image.reference, tag).await.map_err(|e| {
                        PipelineError::stage(stage, format!("push of tag {tag} failed: {e:#}"))
                    })?;
                }
                Ok(Some(format!("pushed {}", ctx.tags.as_slice().join(", "))))
            }
            StageKind::Deploy => {
                if ctx.environment.requires_approval()
                    && !state
                        .approval
                        .as_ref()
                        .is_some_and(ApprovalRecord::allows_deploy)
                {
                    return Err(PipelineError::DeployFailure(format!(
                        "deploy to {} requires an approved approval gate",
                        ctx.environment
                    )));
                }
                let image = built_image(state, stage)?;
                let record = DeployRunner::run(
                    c.deployer.as_ref(),
                    self.log.as_ref(),
                    ctx,
                    &image.reference,
                )
                .await?;
                state.deployment = Some(record);
                Ok(Some(format!("deployed to {}", ctx.environment)))
            }
        }
    }

    fn record_gate(&self, state: &mut RunState, decision: GateDecision) -> Result<Option<String>> {
        obs::emit_gate_evaluated(decision.gate, decision.status, &decision.detail);
        state.gates.push(decision.clone());
        let decision = decision.into_result()?;
        Ok(Some(match decision.status {
            GateStatus::Warn => format!("warn: {}", decision.detail),
            _ => decision.detail,
        }))
    }
}

fn built_image(state: &RunState, stage: StageKind) -> Result<BuiltImage> {
    state
        .image
        .clone()
        .ok_or_else(|| PipelineError::stage(stage, "no image was built"))
}
