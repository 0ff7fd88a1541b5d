//! Gate evaluation: external tool reports → ok / warn / block.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Which gate produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Quality,
    Security,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GateKind::Quality => "quality",
            GateKind::Security => "security",
        })
    }
}

/// Gate verdict. `Block` is fatal, `Warn` is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Ok,
    Warn,
    Block,
}

/// Decision produced by a gate evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub gate: GateKind,
    pub status: GateStatus,
    pub detail: String,
}

impl GateDecision {
    pub fn is_blocking(&self) -> bool {
        self.status == GateStatus::Block
    }

    /// Convert a blocking decision into the matching error.
    pub fn into_result(self) -> Result<GateDecision> {
        if self.is_blocking() {
            Err(PipelineError::GateBlock {
                gate: self.gate,
                detail: self.detail,
            })
        } else {
            Ok(self)
        }
    }
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

/// Status of one quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

/// Report from the quality-scan collaborator, keyed by check name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub checks: BTreeMap<String, CheckStatus>,
}

impl QualityReport {
    pub fn with_check(mut self, name: impl Into<String>, status: CheckStatus) -> Self {
        self.checks.insert(name.into(), status);
        self
    }

    /// Worst status across all checks; `None` for an empty report.
    pub fn aggregate(&self) -> Option<CheckStatus> {
        self.checks.values().copied().max()
    }
}

/// Quality gate: any non-OK aggregate blocks.
pub struct QualityGate;

impl QualityGate {
    pub fn evaluate(report: &QualityReport) -> GateDecision {
        let failing: Vec<&str> = report
            .checks
            .iter()
            .filter(|(_, status)| **status != CheckStatus::Ok)
            .map(|(name, _)| name.as_str())
            .collect();

        let (status, detail) = match report.aggregate() {
            None => (GateStatus::Block, "quality report contained no checks".to_string()),
            Some(CheckStatus::Ok) => (
                GateStatus::Ok,
                format!("{} check(s) passed", report.checks.len()),
            ),
            Some(_) => (
                GateStatus::Block,
                format!("non-OK quality checks: {}", failing.join(", ")),
            ),
        };

        GateDecision {
            gate: GateKind::Quality,
            status,
            detail,
        }
    }

    /// Decision used when the quality verdict never arrived.
    pub fn not_ready(waited_secs: u64) -> GateDecision {
        GateDecision {
            gate: GateKind::Quality,
            status: GateStatus::Block,
            detail: format!("quality gate verdict not ready after {waited_secs}s"),
        }
    }
}

// ---------------------------------------------------------------------------
// Security gate
// ---------------------------------------------------------------------------

/// Vulnerability severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(Severity::Unknown),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(PipelineError::Configuration(format!(
                "unknown severity: {other}"
            ))),
        }
    }
}

/// One vulnerability finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub package: Option<String>,
}

/// Report from the security-scan collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityReport {
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl SecurityReport {
    pub fn counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Whether the security gate may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Findings are reported as warnings; the gate never blocks.
    Observe,
    /// Findings at or above `block_at` block the run.
    Enforce,
}

/// Severity thresholds for the security gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub mode: SecurityMode,
    pub block_at: Severity,
    pub warn_at: Severity,
}

impl SecurityPolicy {
    pub fn enforce(block_at: Severity, warn_at: Severity) -> Result<Self> {
        Self::new(SecurityMode::Enforce, block_at, warn_at)
    }

    pub fn observe(warn_at: Severity) -> Self {
        Self {
            mode: SecurityMode::Observe,
            block_at: Severity::Critical,
            warn_at,
        }
    }

    /// # Errors
    ///
    /// `Configuration` when `warn_at` is above `block_at`.
    pub fn new(mode: SecurityMode, block_at: Severity, warn_at: Severity) -> Result<Self> {
        if warn_at > block_at {
            return Err(PipelineError::Configuration(format!(
                "security warn threshold ({warn_at}) is above block threshold ({block_at})"
            )));
        }
        Ok(Self {
            mode,
            block_at,
            warn_at,
        })
    }
}

/// Security-scan gate parameterised by an explicit policy.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    policy: SecurityPolicy,
}

impl SecurityGate {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn evaluate(&self, report: &SecurityReport) -> GateDecision {
        let counts = report.counts();
        let summary = if counts.is_empty() {
            "no findings".to_string()
        } else {
            counts
                .iter()
                .rev()
                .map(|(sev, n)| format!("{n} {sev}"))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let status = match report.max_severity() {
            Some(max) if self.policy.mode == SecurityMode::Enforce && max >= self.policy.block_at => {
                GateStatus::Block
            }
            Some(max) if max >= self.policy.warn_at => GateStatus::Warn,
            _ => GateStatus::Ok,
        };

        let mode = match self.policy.mode {
            SecurityMode::Observe => "observe",
            SecurityMode::Enforce => "enforce",
        };

        GateDecision {
            gate: GateKind::Security,
            status,
            detail: format!("{summary} (policy: {mode})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(id: &str, severity: Severity) -> Finding {
        Finding {
            id: id.to_string(),
            severity,
            package: None,
        }
    }

    #[test]
    fn test_quality_all_ok_passes() {
        let report = QualityReport::default()
            .with_check("bugs", CheckStatus::Ok)
            .with_check("coverage", CheckStatus::Ok);
        let decision = QualityGate::evaluate(&report);
        assert_eq!(decision.status, GateStatus::Ok);
        assert!(decision.into_result().is_ok());
    }

    #[test]
    fn test_quality_any_non_ok_blocks() {
        let report = QualityReport::default()
            .with_check("bugs", CheckStatus::Ok)
            .with_check("smells", CheckStatus::Warn);
        let decision = QualityGate::evaluate(&report);
        assert_eq!(decision.status, GateStatus::Block);
        assert!(decision.detail.contains("smells"));

        let err = decision.into_result().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::GateBlock {
                gate: GateKind::Quality,
                ..
            }
        ));
    }

    #[test]
    fn test_quality_empty_report_blocks() {
        let decision = QualityGate::evaluate(&QualityReport::default());
        assert!(decision.is_blocking());
    }

    #[test]
    fn test_security_enforce_blocks_on_critical() {
        let gate = SecurityGate::new(
            SecurityPolicy::enforce(Severity::Critical, Severity::High).unwrap(),
        );
        let report = SecurityReport {
            findings: vec![
                finding("CVE-1", Severity::Critical),
                finding("CVE-2", Severity::High),
            ],
        };
        let decision = gate.evaluate(&report);
        assert_eq!(decision.status, GateStatus::Block);
        assert!(decision.detail.starts_with("1 critical, 1 high"));
    }

    #[test]
    fn test_security_enforce_warns_below_block() {
        let gate = SecurityGate::new(
            SecurityPolicy::enforce(Severity::Critical, Severity::High).unwrap(),
        );
        let report = SecurityReport {
            findings: vec![finding("CVE-2", Severity::High)],
        };
        assert_eq!(gate.evaluate(&report).status, GateStatus::Warn);
    }

    #[test]
    fn test_security_observe_never_blocks() {
        let gate = SecurityGate::new(SecurityPolicy::observe(Severity::High));
        let report = SecurityReport {
            findings: vec![finding("CVE-1", Severity::Critical)],
        };
        let decision = gate.evaluate(&report);
        assert_eq!(decision.status, GateStatus::Warn);
        assert!(decision.detail.contains("observe"));
    }

    #[test]
    fn test_security_clean_report_ok() {
        let gate = SecurityGate::new(
            SecurityPolicy::enforce(Severity::Critical, Severity::High).unwrap(),
        );
        let report = SecurityReport {
            findings: vec![finding("CVE-9", Severity::Low)],
        };
        assert_eq!(gate.evaluate(&report).status, GateStatus::Ok);
        assert_eq!(
            gate.evaluate(&SecurityReport::default()).detail,
            "no findings (policy: enforce)"
        );
    }

    #[test]
    fn test_policy_rejects_inverted_thresholds() {
        assert!(SecurityPolicy::enforce(Severity::High, Severity::Critical).is_err());
    }

    #[test]
    fn test_security_report_deserializes() {
        let report: SecurityReport = serde_json::from_str(
            r#"{"findings":[{"id":"CVE-2024-1","severity":"critical","package":"openssl"}]}"#,
        )
        .unwrap();
        assert_eq!(report.max_severity(), Some(Severity::Critical));
    }
}
