//! Immutable per-run context threaded through every stage.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::environment::{Environment, Resolution};
use crate::stage::StagePlan;
use crate::tagger::{ImageTagger, TagSet};
use crate::trigger::Trigger;

/// Everything a stage may read about the run. Created once after resolution
/// and never mutated; stage outputs live in the sequencer's run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub trigger: Trigger,
    /// Environment the branch maps to.
    pub resolved_environment: Environment,
    /// Environment the run actually promotes to (`None` for pull requests).
    pub environment: Environment,
    pub tags: TagSet,
    pub tagger: ImageTagger,
    /// Build context handed to the build and quality collaborators.
    pub source_dir: PathBuf,
    /// SHA-256 over environment, applicable stages and tags.
    pub plan_digest: String,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        trigger: Trigger,
        resolution: &Resolution,
        tagger: ImageTagger,
        plan: &StagePlan,
        source_dir: PathBuf,
    ) -> Self {
        let environment = if trigger.event_kind.may_promote() {
            resolution.environment
        } else {
            Environment::None
        };
        let tags = tagger.tags(trigger.build_id, environment, &resolution.tag_policy);
        let stage_names: Vec<&str> = plan
            .applicable(environment)
            .into_iter()
            .map(|k| k.name())
            .collect();
        let plan_digest = compute_plan_digest(environment, &stage_names, &tags);

        Self {
            run_id: run_id.into(),
            trigger,
            resolved_environment: resolution.environment,
            environment,
            tags,
            tagger,
            source_dir,
            plan_digest,
        }
    }

    /// Reference carrying the build-number tag.
    pub fn build_reference(&self) -> String {
        self.tagger.reference(self.tags.build_tag())
    }

    pub fn branch(&self) -> &str {
        self.trigger.branch_label()
    }

    pub fn build_id(&self) -> u64 {
        self.trigger.build_id
    }
}

/// Deterministic digest of what a run will do.
fn compute_plan_digest(environment: Environment, stages: &[&str], tags: &TagSet) -> String {
    let mut hasher = Sha256::new();
    hasher.update(environment.as_str().as_bytes());
    hasher.update(b"\0");
    for stage in stages {
        hasher.update(stage.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(b"\x01");
    for tag in tags.iter() {
        hasher.update(tag.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Resolver;
    use crate::trigger::EventKind;

    fn context(trigger: Trigger) -> RunContext {
        let resolution = Resolver::standard().resolve(&trigger).unwrap();
        RunContext::new(
            "run",
            trigger,
            &resolution,
            ImageTagger::new(None, "db"),
            &StagePlan::default(),
            PathBuf::from("."),
        )
    }

    #[test]
    fn test_push_keeps_resolved_environment() {
        let ctx = context(Trigger::push("main", 4));
        assert_eq!(ctx.environment, Environment::Prod);
        assert_eq!(ctx.build_reference(), "db:4");
        assert_eq!(ctx.tags.as_slice(), ["4", "latest"]);
    }

    #[test]
    fn test_pull_request_never_promotes() {
        let ctx = context(Trigger::new(Some("main".into()), 4, EventKind::PullRequest));
        assert_eq!(ctx.resolved_environment, Environment::Prod);
        assert_eq!(ctx.environment, Environment::None);
        assert_eq!(ctx.tags.as_slice(), ["4"]);
    }

    #[test]
    fn test_plan_digest_is_deterministic() {
        let a = context(Trigger::push("develop", 8));
        let b = context(Trigger::push("develop", 8));
        assert_eq!(a.plan_digest, b.plan_digest);
        assert_eq!(a.plan_digest.len(), 64);

        let c = context(Trigger::push("develop", 9));
        assert_ne!(a.plan_digest, c.plan_digest);
    }
}
