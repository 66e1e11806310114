use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::kind::EntityKind;

/// A deployment environment such as "production" or "staging".
///
/// Environments can be addressed by id or by name; both count as an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEnvironment {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

impl DeploymentEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
        }
    }

    /// Returns `true` if `alias` is this environment's id or name.
    pub fn matches_alias(&self, alias: &str) -> bool {
        self.id == alias || self.name == alias
    }
}

impl Entity for DeploymentEnvironment {
    const KIND: EntityKind = EntityKind::DeploymentEnvironment;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_alias() {
        let mut env = DeploymentEnvironment::new("production");
        env.set_id("env-1".to_string());
        assert!(env.matches_alias("production"));
        assert!(env.matches_alias("env-1"));
        assert!(!env.matches_alias("staging"));
    }
}
