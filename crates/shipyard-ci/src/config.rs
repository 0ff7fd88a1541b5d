//! Pipeline configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::gate::{SecurityMode, SecurityPolicy, Severity};
use crate::readiness::ReadinessConfig;
use crate::stage::{StageKind, StagePlan};
use crate::tagger::ImageTagger;

/// Resolved settings a [`crate::Pipeline`] runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub tagger: ImageTagger,
    /// Directory the source and image builds run in.
    pub build_context: PathBuf,
    pub readiness: ReadinessConfig,
    pub approval_timeout: Duration,
    /// Bound on waiting for the quality verdict.
    pub quality_timeout: Duration,
    pub security: SecurityPolicy,
    /// Severity filter handed to the security scanner.
    pub severities: Vec<Severity>,
    pub plan: StagePlan,
}

impl PipelineSettings {
    /// Settings with default timeouts and an all-fatal plan.
    pub fn new(tagger: ImageTagger, security: SecurityPolicy) -> Self {
        Self {
            tagger,
            build_context: PathBuf::from("."),
            readiness: ReadinessConfig::default(),
            approval_timeout: Duration::from_secs(DEFAULT_APPROVAL_TIMEOUT_SECS),
            quality_timeout: Duration::from_secs(DEFAULT_QUALITY_TIMEOUT_SECS),
            security,
            severities: default_severities(),
            plan: StagePlan::default(),
        }
    }
}

const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_QUALITY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 1800;

fn default_severities() -> Vec<Severity> {
    vec![Severity::High, Severity::Critical]
}

/// `[image]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSection {
    pub registry: Option<String>,
    pub repository: String,
    pub context: PathBuf,
    /// Health-check command baked into the image.
    pub health_check: Option<String>,
    pub port: Option<u16>,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            registry: None,
            repository: String::new(),
            context: PathBuf::from("."),
            health_check: None,
            port: None,
        }
    }
}

/// `[readiness]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSection {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        let d = ReadinessConfig::default();
        Self {
            interval_secs: d.interval.as_secs(),
            timeout_secs: d.timeout.as_secs(),
            probe_timeout_secs: d.probe_timeout.as_secs(),
        }
    }
}

/// `[approval]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalSection {
    pub timeout_secs: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
        }
    }
}

/// `[quality]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualitySection {
    pub gate_timeout_secs: u64,
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            gate_timeout_secs: DEFAULT_QUALITY_TIMEOUT_SECS,
        }
    }
}

/// `[security]`. `mode` has no default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySection {
    pub mode: Option<SecurityMode>,
    pub block_at: Severity,
    pub warn_at: Severity,
    pub severities: Vec<Severity>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            mode: None,
            block_at: Severity::Critical,
            warn_at: Severity::High,
            severities: default_severities(),
        }
    }
}

/// `[stages]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagesSection {
    pub advisory: Vec<StageKind>,
}

/// `[commands]`: argv templates, first element is the executable.
///
/// Arguments may contain `{branch}`, `{build_id}`, `{env}`, `{image}`,
/// `{tag}`, `{target}`, `{source}`, `{severities}` and `{resource}`.
/// `{target}` is the image reference retagged for a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsSection {
    pub build: Option<Vec<String>>,
    pub test: Option<Vec<String>>,
    pub quality: Option<Vec<String>>,
    pub image_build: Option<Vec<String>>,
    pub security_scan: Option<Vec<String>>,
    pub push: Option<Vec<String>>,
    pub deploy: Option<Vec<String>>,
    pub test_db_start: Option<Vec<String>>,
    pub test_db_stop: Option<Vec<String>>,
    pub health_check: Option<Vec<String>>,
    pub timeout_secs: u64,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            build: None,
            test: None,
            quality: None,
            image_build: None,
            security_scan: None,
            push: None,
            deploy: None,
            test_db_start: None,
            test_db_stop: None,
            health_check: None,
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl CommandsSection {
    fn named(&self) -> [(&'static str, Option<&Vec<String>>); 10] {
        [
            ("build", self.build.as_ref()),
            ("test", self.test.as_ref()),
            ("quality", self.quality.as_ref()),
            ("image_build", self.image_build.as_ref()),
            ("security_scan", self.security_scan.as_ref()),
            ("push", self.push.as_ref()),
            ("deploy", self.deploy.as_ref()),
            ("test_db_start", self.test_db_start.as_ref()),
            ("test_db_stop", self.test_db_stop.as_ref()),
            ("health_check", self.health_check.as_ref()),
        ]
    }
}

/// `[notify]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifySection {
    pub webhook_url: Option<String>,
}

/// On-disk pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub image: ImageSection,
    pub readiness: ReadinessSection,
    pub approval: ApprovalSection,
    pub quality: QualitySection,
    pub security: SecuritySection,
    pub stages: StagesSection,
    pub commands: CommandsSection,
    pub notify: NotifySection,
}

impl PipelineConfig {
    /// Read and parse a TOML config file.
    ///
    /// # Errors
    ///
    /// `Configuration` when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw).map_err(|e| match e {
            PipelineError::Configuration(msg) => {
                PipelineError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// Validate and turn the file into run settings.
    ///
    /// # Errors
    ///
    /// `Configuration` on any invalid value; nothing runs in that case.
    pub fn settings(&self) -> Result<PipelineSettings> {
        if self.image.repository.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "image.repository is required".to_string(),
            ));
        }

        let mode = self.security.mode.ok_or_else(|| {
            PipelineError::Configuration(
                "security.mode is required (\"enforce\" or \"observe\")".to_string(),
            )
        })?;
        let security = SecurityPolicy::new(mode, self.security.block_at, self.security.warn_at)?;

        let readiness = ReadinessConfig {
            interval: nonzero_secs("readiness.interval_secs", self.readiness.interval_secs)?,
            timeout: nonzero_secs("readiness.timeout_secs", self.readiness.timeout_secs)?,
            probe_timeout: nonzero_secs(
                "readiness.probe_timeout_secs",
                self.readiness.probe_timeout_secs,
            )?,
        };

        self.validate_commands()?;

        Ok(PipelineSettings {
            tagger: ImageTagger::new(self.image.registry.clone(), self.image.repository.trim()),
            build_context: self.image.context.clone(),
            readiness,
            approval_timeout: nonzero_secs("approval.timeout_secs", self.approval.timeout_secs)?,
            quality_timeout: nonzero_secs(
                "quality.gate_timeout_secs",
                self.quality.gate_timeout_secs,
            )?,
            security,
            severities: self.security.severities.clone(),
            plan: StagePlan::with_advisory(&self.stages.advisory)?,
        })
    }

    fn validate_commands(&self) -> Result<()> {
        nonzero_secs("commands.timeout_secs", self.commands.timeout_secs)?;
        for (name, argv) in self.commands.named() {
            if argv.is_some_and(|a| a.is_empty() || a[0].trim().is_empty()) {
                return Err(PipelineError::Configuration(format!(
                    "commands.{name} must name an executable"
                )));
            }
        }
        Ok(())
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.notify
            .webhook_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
    }
}

fn nonzero_secs(key: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(PipelineError::Configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[image]
registry = "registry.example.com"
repository = "subscriptions-db"

[security]
mode = "enforce"
block_at = "critical"
warn_at = "high"

[stages]
advisory = ["test"]

[commands]
build = ["make", "build", "BUILD={build_id}"]
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let settings = config.settings().unwrap();

        assert_eq!(settings.security.mode, SecurityMode::Enforce);
        assert_eq!(
            settings.tagger.reference("42"),
            "registry.example.com/subscriptions-db:42"
        );
        assert_eq!(settings.readiness, ReadinessConfig::default());
        assert_eq!(settings.approval_timeout, Duration::from_secs(1800));
        let test = settings
            .plan
            .stages()
            .iter()
            .find(|d| d.kind == StageKind::Test)
            .unwrap();
        assert!(!test.fatal);
    }

    #[test]
    fn test_missing_security_mode_rejected() {
        let config = PipelineConfig::from_toml_str(
            r#"
[image]
repository = "app"
"#,
        )
        .unwrap();
        let err = config.settings().unwrap_err();
        assert!(err.to_string().contains("security.mode"));
    }

    #[test]
    fn test_non_advisory_stage_rejected() {
        let raw = SAMPLE.replace(r#"advisory = ["test"]"#, r#"advisory = ["deploy"]"#);
        let config = PipelineConfig::from_toml_str(&raw).unwrap();
        assert!(matches!(
            config.settings(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let raw = format!("{SAMPLE}\n[readiness]\ntimeout_secs = 0\n");
        let config = PipelineConfig::from_toml_str(&raw).unwrap();
        let err = config.settings().unwrap_err();
        assert!(err.to_string().contains("readiness.timeout_secs"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let raw = SAMPLE.replace(r#"warn_at = "high""#, r#"warn_at = "critical""#)
            .replace(r#"block_at = "critical""#, r#"block_at = "high""#);
        let config = PipelineConfig::from_toml_str(&raw).unwrap();
        assert!(config.settings().is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = PipelineConfig::from_toml_str("[image]\nrepo = \"x\"\n").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_empty_command_rejected() {
        let raw = SAMPLE.replace(r#"build = ["make", "build", "BUILD={build_id}"]"#, "build = []");
        let config = PipelineConfig::from_toml_str(&raw).unwrap();
        let err = config.settings().unwrap_err();
        assert!(err.to_string().contains("commands.build"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipyard.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.image.repository, "subscriptions-db");
        assert!(config.webhook_url().is_none());

        let missing = PipelineConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(missing.to_string().contains("cannot read"));
    }
}
