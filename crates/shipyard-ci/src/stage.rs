//! Stage definitions and the ordered stage plan.

use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::error::{PipelineError, Result};

/// Pipeline stages, in canonical execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Validate and assemble the build context.
    Build,
    /// Integration tests against a transient database.
    Test,
    /// Static analysis verdict.
    QualityGate,
    /// Container image build.
    ImageBuild,
    /// Vulnerability scan of the built image.
    SecurityScan,
    /// Human confirmation (prod only).
    ApprovalGate,
    /// Registry push of every tag.
    Push,
    /// Environment rollout.
    Deploy,
}

impl StageKind {
    /// Every stage in execution order.
    pub const ALL: [StageKind; 8] = [
        StageKind::Build,
        StageKind::Test,
        StageKind::QualityGate,
        StageKind::ImageBuild,
        StageKind::SecurityScan,
        StageKind::ApprovalGate,
        StageKind::Push,
        StageKind::Deploy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Build => "build",
            StageKind::Test => "test",
            StageKind::QualityGate => "quality_gate",
            StageKind::ImageBuild => "image_build",
            StageKind::SecurityScan => "security_scan",
            StageKind::ApprovalGate => "approval_gate",
            StageKind::Push => "push",
            StageKind::Deploy => "deploy",
        }
    }

    /// Whether a failure of this stage may be configured as advisory.
    ///
    /// Later stages consume the artifacts of build, image build, approval and
    /// push, and a deploy failure is never downgraded.
    pub fn can_be_advisory(&self) -> bool {
        matches!(
            self,
            StageKind::Test | StageKind::QualityGate | StageKind::SecurityScan
        )
    }

    /// Default applicability of the stage.
    pub fn default_applicability(&self) -> Applicability {
        match self {
            StageKind::Build | StageKind::Test | StageKind::QualityGate => Applicability::Always,
            StageKind::ImageBuild | StageKind::SecurityScan => Applicability::Always,
            StageKind::ApprovalGate => Applicability::ApprovalRequired,
            StageKind::Push | StageKind::Deploy => Applicability::Deployable,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        StageKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| PipelineError::Configuration(format!("unknown stage: {s}")))
    }
}

/// Predicate over the resolved environment deciding whether a stage runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    Always,
    /// Only for environments that receive pushes and deployments.
    Deployable,
    /// Only for environments gated by human approval.
    ApprovalRequired,
}

impl Applicability {
    pub fn applies(&self, environment: Environment) -> bool {
        match self {
            Applicability::Always => true,
            Applicability::Deployable => environment.is_deployable(),
            Applicability::ApprovalRequired => environment.requires_approval(),
        }
    }
}

/// Declaration of one stage in a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDecl {
    pub kind: StageKind,
    pub applicability: Applicability,
    /// Fatal failures halt the plan; advisory ones are only recorded.
    pub fatal: bool,
}

impl StageDecl {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            applicability: kind.default_applicability(),
            fatal: true,
        }
    }

    /// Downgrade failures of this stage to advisory.
    pub fn advisory(mut self) -> Self {
        self.fatal = false;
        self
    }
}

/// Ordered list of stage declarations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<StageDecl>,
}

impl Default for StagePlan {
    fn default() -> Self {
        Self {
            stages: StageKind::ALL.into_iter().map(StageDecl::new).collect(),
        }
    }
}

impl StagePlan {
    /// Canonical plan with the given stages downgraded to advisory.
    ///
    /// # Errors
    ///
    /// `Configuration` when a stage that cannot be advisory is named.
    pub fn with_advisory(advisory: &[StageKind]) -> Result<Self> {
        if let Some(bad) = advisory.iter().find(|k| !k.can_be_advisory()) {
            return Err(PipelineError::Configuration(format!(
                "stage {bad} cannot be advisory"
            )));
        }
        let stages = StageKind::ALL
            .into_iter()
            .map(|kind| {
                let decl = StageDecl::new(kind);
                if advisory.contains(&kind) {
                    decl.advisory()
                } else {
                    decl
                }
            })
            .collect();
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageDecl] {
        &self.stages
    }

    /// Stage names that will run (not be skipped) for an environment.
    pub fn applicable(&self, environment: Environment) -> Vec<StageKind> {
        self.stages
            .iter()
            .filter(|s| s.applicability.applies(environment))
            .map(|s| s.kind)
            .collect()
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Passed,
    Failed,
    Skipped,
}

/// Recorded result of one stage. Immutable once pushed to the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub name: StageKind,
    pub outcome: StageOutcome,
    /// Whether the stage was declared fatal.
    pub blocking: bool,
    /// Failure reason, gate warning, or other context.
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn skipped(decl: &StageDecl) -> Self {
        Self {
            name: decl.kind,
            outcome: StageOutcome::Skipped,
            blocking: decl.fatal,
            detail: None,
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == StageOutcome::Passed
    }

    pub fn failed(&self) -> bool {
        self.outcome == StageOutcome::Failed
    }

    /// A failure that halted the run.
    pub fn is_fatal_failure(&self) -> bool {
        self.failed() && self.blocking
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_roundtrip() {
        for kind in StageKind::ALL {
            assert_eq!(kind.name().parse::<StageKind>().unwrap(), kind);
        }
        assert_eq!(
            "security-scan".parse::<StageKind>().unwrap(),
            StageKind::SecurityScan
        );
        assert!("lint".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_canonical_order() {
        let plan = StagePlan::default();
        let kinds: Vec<_> = plan.stages().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
        assert!(plan.stages().iter().all(|s| s.fatal));
    }

    #[test]
    fn test_applicability_by_environment() {
        let plan = StagePlan::default();
        let none = plan.applicable(Environment::None);
        assert!(!none.contains(&StageKind::Push));
        assert!(!none.contains(&StageKind::Deploy));
        assert!(!none.contains(&StageKind::ApprovalGate));

        let staging = plan.applicable(Environment::Staging);
        assert!(staging.contains(&StageKind::Deploy));
        assert!(!staging.contains(&StageKind::ApprovalGate));

        let prod = plan.applicable(Environment::Prod);
        assert_eq!(prod, StageKind::ALL.to_vec());
    }

    #[test]
    fn test_advisory_stages() {
        let plan = StagePlan::with_advisory(&[StageKind::Test]).unwrap();
        let test = plan
            .stages()
            .iter()
            .find(|s| s.kind == StageKind::Test)
            .unwrap();
        assert!(!test.fatal);
    }

    #[test]
    fn test_deploy_cannot_be_advisory() {
        let err = StagePlan::with_advisory(&[StageKind::Deploy]).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_stage_result_fatal_failure() {
        let result = StageResult {
            name: StageKind::Test,
            outcome: StageOutcome::Failed,
            blocking: false,
            detail: Some("flaky".into()),
            duration_ms: 10,
        };
        assert!(result.failed());
        assert!(!result.is_fatal_failure());
    }
}
