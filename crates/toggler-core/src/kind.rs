//! Entity kind discriminant.
//!
//! Every value that crosses a storage or cache boundary is tagged with an
//! [`EntityKind`]. The tag string doubles as the cache namespace and as the
//! filter key for cached query rows, so it must stay stable across releases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Discriminant for every entity type the storage layer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A named feature flag.
    ReleaseFlag,
    /// A rollout plan binding a flag to a deployment environment.
    ReleaseRollout,
    /// A manual per-user override of a rollout.
    ReleasePilot,
    /// A deployment environment (e.g. "production", "staging").
    DeploymentEnvironment,
    /// An API access token.
    #[serde(rename = "security_token")]
    Token,
    /// A cached query result row. Only ever stored inside a cache.
    CachedQuery,
}

impl EntityKind {
    /// All kinds, in declaration order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::ReleaseFlag,
        EntityKind::ReleaseRollout,
        EntityKind::ReleasePilot,
        EntityKind::DeploymentEnvironment,
        EntityKind::Token,
        EntityKind::CachedQuery,
    ];

    /// Kinds owned by the domain storage. These are the kinds a cache tracks
    /// change events for.
    pub const DOMAIN: [EntityKind; 5] = [
        EntityKind::ReleaseFlag,
        EntityKind::ReleaseRollout,
        EntityKind::ReleasePilot,
        EntityKind::DeploymentEnvironment,
        EntityKind::Token,
    ];

    /// Returns the stable string tag for this kind.
    pub const fn tag(&self) -> &'static str {
        match self {
            EntityKind::ReleaseFlag => "release_flag",
            EntityKind::ReleaseRollout => "release_rollout",
            EntityKind::ReleasePilot => "release_pilot",
            EntityKind::DeploymentEnvironment => "deployment_environment",
            EntityKind::Token => "security_token",
            EntityKind::CachedQuery => "cached_query",
        }
    }

    /// Looks up a kind by its tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Returns `true` for kinds stored by the domain storage.
    pub fn is_domain(&self) -> bool {
        !matches!(self, EntityKind::CachedQuery)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| CoreError::unknown_entity_type(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tags_are_unique() {
        let tags: HashSet<_> = EntityKind::ALL.iter().map(|k| k.tag()).collect();
        assert_eq!(tags.len(), EntityKind::ALL.len());
    }

    #[test]
    fn test_tag_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(kind.to_string().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("release_flags".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_domain_kinds() {
        assert!(EntityKind::DOMAIN.iter().all(|k| k.is_domain()));
        assert!(!EntityKind::CachedQuery.is_domain());
    }

    #[test]
    fn test_serde_uses_tag() {
        let json = serde_json::to_string(&EntityKind::DeploymentEnvironment).unwrap();
        assert_eq!(json, "\"deployment_environment\"");
    }
}
