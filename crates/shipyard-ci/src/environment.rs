//! Branch → environment resolution.
//!
//! Promotion targets are data, not control flow: a [`Resolver`] walks an
//! ordered rule table and the first matching rule decides the environment
//! and the alias tags. Branches that match no rule build and test only.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::trigger::Trigger;

/// Deployment target a build is promoted toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
    /// No promotion: build and test only.
    None,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
            Self::None => "none",
        }
    }

    /// Whether the environment receives pushes and deployments.
    pub fn is_deployable(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether a human must confirm before deploying.
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Prod),
            "none" => Ok(Self::None),
            other => Err(PipelineError::Configuration(format!(
                "unknown environment: {other}"
            ))),
        }
    }
}

/// Alias tags to apply alongside the build-number tag.
///
/// The build-number tag itself is not stored here; the tagger always adds it,
/// so no policy can omit it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPolicy {
    aliases: Vec<String>,
}

impl TagPolicy {
    /// Policy with no alias tags.
    pub fn build_only() -> Self {
        Self::default()
    }

    /// Policy with the given aliases, deduplicated in first-seen order.
    pub fn with_aliases<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for alias in aliases {
            let alias = alias.into();
            if !out.contains(&alias) {
                out.push(alias);
            }
        }
        Self { aliases: out }
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }
}

/// How a rule matches a branch name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum BranchPattern {
    Exact(String),
    /// Prefix match; the remainder becomes available as a version tag.
    Prefix(String),
}

/// One row of the resolution table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRule {
    pub pattern: BranchPattern,
    pub environment: Environment,
    /// Fixed alias tags (e.g. `latest`).
    pub aliases: Vec<String>,
    /// Append the text after a prefix match as a literal tag.
    #[serde(default)]
    pub suffix_as_tag: bool,
}

impl ResolutionRule {
    pub fn exact(branch: &str, environment: Environment, aliases: &[&str]) -> Self {
        Self {
            pattern: BranchPattern::Exact(branch.to_string()),
            environment,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            suffix_as_tag: false,
        }
    }

    pub fn prefix(prefix: &str, environment: Environment, aliases: &[&str]) -> Self {
        Self {
            pattern: BranchPattern::Prefix(prefix.to_string()),
            environment,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            suffix_as_tag: true,
        }
    }

    /// Returns the matched suffix (empty for exact matches) when the rule applies.
    fn matches<'a>(&self, branch: &'a str) -> Option<&'a str> {
        match &self.pattern {
            BranchPattern::Exact(name) => (branch == name).then_some(""),
            BranchPattern::Prefix(prefix) => branch.strip_prefix(prefix.as_str()),
        }
    }
}

/// Outcome of resolving a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub environment: Environment,
    pub tag_policy: TagPolicy,
}

impl Resolution {
    fn unpromoted() -> Self {
        Self {
            environment: Environment::None,
            tag_policy: TagPolicy::build_only(),
        }
    }
}

/// Ordered, first-match-wins rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolver {
    rules: Vec<ResolutionRule>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::standard()
    }
}

impl Resolver {
    /// `main` → prod, `develop` → dev, `release/*` → staging.
    pub fn standard() -> Self {
        Self::new(vec![
            ResolutionRule::exact("main", Environment::Prod, &["latest"]),
            ResolutionRule::exact("develop", Environment::Dev, &["dev-latest"]),
            ResolutionRule::prefix("release/", Environment::Staging, &["staging-latest"]),
        ])
    }

    pub fn new(rules: Vec<ResolutionRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ResolutionRule] {
        &self.rules
    }

    /// Resolve a branch name to its environment and alias tags.
    ///
    /// Unmatched branches resolve to [`Environment::None`].
    ///
    /// # Errors
    ///
    /// `Configuration` when a prefix rule matches but the remainder is not a
    /// valid registry tag (e.g. `release/` or `release/a/b`), or when it would
    /// overwrite another environment's alias (e.g. `release/latest`).
    pub fn resolve_branch(&self, branch: &str) -> Result<Resolution> {
        for rule in &self.rules {
            let Some(suffix) = rule.matches(branch) else {
                continue;
            };

            let mut aliases = rule.aliases.clone();
            if rule.suffix_as_tag {
                if !is_valid_tag(suffix) {
                    return Err(PipelineError::Configuration(format!(
                        "branch '{branch}' does not carry a valid version tag after its prefix"
                    )));
                }
                if self.is_reserved_alias(suffix) {
                    return Err(PipelineError::Configuration(format!(
                        "branch '{branch}' version tag '{suffix}' collides with a reserved alias"
                    )));
                }
                aliases.push(suffix.to_string());
            }

            return Ok(Resolution {
                environment: rule.environment,
                tag_policy: TagPolicy::with_aliases(aliases),
            });
        }
        Ok(Resolution::unpromoted())
    }

    /// Whether `tag` is a fixed alias of any rule.
    fn is_reserved_alias(&self, tag: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.aliases.iter().any(|alias| alias == tag))
    }

    /// Resolve a trigger.
    ///
    /// # Errors
    ///
    /// `Configuration` when the event requires a branch and none is present.
    pub fn resolve(&self, trigger: &Trigger) -> Result<Resolution> {
        match trigger.branch_name() {
            Some(branch) => self.resolve_branch(branch),
            None if trigger.event_kind.requires_branch() => {
                Err(PipelineError::Configuration(format!(
                    "{} event for build {} carries no branch name",
                    trigger.event_kind, trigger.build_id
                )))
            }
            None => Ok(Resolution::unpromoted()),
        }
    }
}

/// Registry tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::EventKind;

    #[test]
    fn test_main_is_prod_with_latest() {
        let r = Resolver::standard().resolve_branch("main").unwrap();
        assert_eq!(r.environment, Environment::Prod);
        assert_eq!(r.tag_policy.aliases(), ["latest"]);
    }

    #[test]
    fn test_develop_is_dev() {
        let r = Resolver::standard().resolve_branch("develop").unwrap();
        assert_eq!(r.environment, Environment::Dev);
        assert_eq!(r.tag_policy.aliases(), ["dev-latest"]);
    }

    #[test]
    fn test_release_branches_are_staging_with_version() {
        for version in ["1.0", "2.3.4", "v7", "2024_10-rc1"] {
            let r = Resolver::standard()
                .resolve_branch(&format!("release/{version}"))
                .unwrap();
            assert_eq!(r.environment, Environment::Staging);
            assert!(r.tag_policy.aliases().contains(&"staging-latest".to_string()));
            assert!(r.tag_policy.aliases().contains(&version.to_string()));
        }
    }

    #[test]
    fn test_other_branches_are_unpromoted() {
        for branch in ["feature/login", "mainline", "hotfix/1", "Main", "develop2"] {
            let r = Resolver::standard().resolve_branch(branch).unwrap();
            assert_eq!(r.environment, Environment::None, "branch {branch}");
            assert!(r.tag_policy.aliases().is_empty());
        }
    }

    #[test]
    fn test_release_without_valid_version_is_configuration_error() {
        for branch in ["release/", "release/a/b", "release/.hidden"] {
            let err = Resolver::standard().resolve_branch(branch).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{branch}");
        }
    }

    #[test]
    fn test_release_version_cannot_shadow_an_alias() {
        for branch in ["release/latest", "release/dev-latest", "release/staging-latest"] {
            let err = Resolver::standard().resolve_branch(branch).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{branch}");
            assert!(err.to_string().contains("reserved alias"), "{branch}");
        }
        // Near misses are still ordinary versions.
        let res = Resolver::standard().resolve_branch("release/latest-2").unwrap();
        assert_eq!(res.tag_policy.aliases(), ["staging-latest", "latest-2"]);
    }

    #[test]
    fn test_missing_branch_on_push_fails() {
        let trigger = Trigger::new(None, 9, EventKind::Push);
        let err = Resolver::standard().resolve(&trigger).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_missing_branch_on_manual_is_unpromoted() {
        let trigger = Trigger::new(None, 9, EventKind::Manual);
        let r = Resolver::standard().resolve(&trigger).unwrap();
        assert_eq!(r.environment, Environment::None);
    }

    #[test]
    fn test_first_match_wins() {
        let resolver = Resolver::new(vec![
            ResolutionRule::prefix("release/", Environment::Staging, &["staging-latest"]),
            ResolutionRule::prefix("release/", Environment::Prod, &["latest"]),
        ]);
        let r = resolver.resolve_branch("release/3").unwrap();
        assert_eq!(r.environment, Environment::Staging);
    }

    #[test]
    fn test_tag_policy_dedups_aliases() {
        let policy = TagPolicy::with_aliases(["a", "b", "a"]);
        assert_eq!(policy.aliases(), ["a", "b"]);
    }

    #[test]
    fn test_is_valid_tag() {
        assert!(is_valid_tag("1.2.3"));
        assert!(is_valid_tag("_x"));
        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag("-x"));
        assert!(!is_valid_tag("a/b"));
        assert!(!is_valid_tag(&"a".repeat(129)));
    }

    #[test]
    fn test_environment_flags() {
        assert!(Environment::Prod.requires_approval());
        assert!(!Environment::Staging.requires_approval());
        assert!(!Environment::None.is_deployable());
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Prod);
    }
}
