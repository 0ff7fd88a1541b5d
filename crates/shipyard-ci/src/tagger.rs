//! Registry tag derivation.
//!
//! Tags are a pure function of (build id, environment, tag policy). The
//! build-number tag is always first and is the only stable pointer to one
//! exact artifact; alias tags such as `latest` move on every promotion.

use serde::{Deserialize, Serialize};

use crate::environment::{Environment, TagPolicy};

/// Ordered, duplicate-free tag set for one build.
///
/// Never empty: the build-number tag is always first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTagSet")]
pub struct TagSet {
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct RawTagSet {
    tags: Vec<String>,
}

impl TryFrom<RawTagSet> for TagSet {
    type Error = String;

    fn try_from(raw: RawTagSet) -> Result<Self, Self::Error> {
        if raw.tags.is_empty() {
            return Err("tag set must contain the build-number tag".to_string());
        }
        Ok(Self { tags: raw.tags })
    }
}

impl TagSet {
    /// The build-number tag.
    pub fn build_tag(&self) -> &str {
        &self.tags[0]
    }

    /// Alias tags (everything except the build-number tag).
    pub fn aliases(&self) -> &[String] {
        &self.tags[1..]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

/// Derives tags and fully qualified references for an image repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTagger {
    /// Registry host (and optional namespace), e.g. `registry.example.com/team`.
    pub registry: Option<String>,
    /// Repository name, e.g. `subscriptions-db`.
    pub repository: String,
}

impl ImageTagger {
    pub fn new(registry: Option<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry
                .map(|r| r.trim_end_matches('/').to_string())
                .filter(|r| !r.is_empty()),
            repository: repository.into(),
        }
    }

    /// Compute the tag set for a build.
    ///
    /// Unpromoted builds (`Environment::None`) never receive alias tags.
    pub fn tags(&self, build_id: u64, environment: Environment, policy: &TagPolicy) -> TagSet {
        let mut tags = vec![build_id.to_string()];
        if environment.is_deployable() {
            for alias in policy.aliases() {
                if !tags.contains(alias) {
                    tags.push(alias.clone());
                }
            }
        }
        TagSet { tags }
    }

    /// Repository path without a tag.
    pub fn repository_path(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// Fully qualified reference for one tag.
    pub fn reference(&self, tag: &str) -> String {
        format!("{}:{}", self.repository_path(), tag)
    }

    /// Fully qualified references for every tag in the set, in order.
    pub fn references(&self, tags: &TagSet) -> Vec<String> {
        tags.iter().map(|t| self.reference(t)).collect()
    }
}
