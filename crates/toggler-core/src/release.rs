//! Release management entities: flags, rollouts and manual pilots.

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{CoreError, Result};
use crate::kind::EntityKind;

/// A named feature flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFlag {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

impl ReleaseFlag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl Entity for ReleaseFlag {
    const KIND: EntityKind = EntityKind::ReleaseFlag;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// A rollout of a flag into one deployment environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRollout {
    #[serde(default)]
    pub id: String,
    pub flag_id: String,
    pub deployment_environment_id: String,
    pub plan: RolloutPlan,
}

impl ReleaseRollout {
    pub fn new(
        flag_id: impl Into<String>,
        deployment_environment_id: impl Into<String>,
        plan: RolloutPlan,
    ) -> Self {
        Self {
            id: String::new(),
            flag_id: flag_id.into(),
            deployment_environment_id: deployment_environment_id.into(),
            plan,
        }
    }
}

impl Entity for ReleaseRollout {
    const KIND: EntityKind = EntityKind::ReleaseRollout;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// A rollout plan definition.
///
/// The variant set is closed: serialization dispatches on the `type` field,
/// so every plan shape that can be persisted is listed here. Evaluating a
/// plan against a pilot is done elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutPlan {
    /// Enroll a deterministic percentage of pilots, keyed by `seed`.
    Percentage { seed: i64, percentage: u8 },
    /// Ask a remote endpoint whether the pilot is enrolled.
    Api { url: String },
    And {
        left: Box<RolloutPlan>,
        right: Box<RolloutPlan>,
    },
    Or {
        left: Box<RolloutPlan>,
        right: Box<RolloutPlan>,
    },
    Not { definition: Box<RolloutPlan> },
}

impl RolloutPlan {
    pub fn percentage(seed: i64, percentage: u8) -> Self {
        RolloutPlan::Percentage { seed, percentage }
    }

    pub fn api(url: impl Into<String>) -> Self {
        RolloutPlan::Api { url: url.into() }
    }

    pub fn and(left: RolloutPlan, right: RolloutPlan) -> Self {
        RolloutPlan::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: RolloutPlan, right: RolloutPlan) -> Self {
        RolloutPlan::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(definition: RolloutPlan) -> Self {
        RolloutPlan::Not {
            definition: Box::new(definition),
        }
    }

    /// Checks the plan's structural constraints, recursing into composites.
    pub fn validate(&self) -> Result<()> {
        match self {
            RolloutPlan::Percentage { percentage, .. } => {
                if *percentage > 100 {
                    return Err(CoreError::invalid_plan(format!(
                        "percentage must be between 0 and 100, got {percentage}"
                    )));
                }
                Ok(())
            }
            RolloutPlan::Api { url } => {
                if url.trim().is_empty() {
                    return Err(CoreError::invalid_plan("api plan requires a url"));
                }
                Ok(())
            }
            RolloutPlan::And { left, right } | RolloutPlan::Or { left, right } => {
                left.validate()?;
                right.validate()
            }
            RolloutPlan::Not { definition } => definition.validate(),
        }
    }
}

/// A manual enrollment (or exclusion) of one external user for a flag in an
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePilot {
    #[serde(default)]
    pub id: String,
    pub flag_id: String,
    pub deployment_environment_id: String,
    pub external_id: String,
    pub is_participating: bool,
}

impl ReleasePilot {
    pub fn new(
        flag_id: impl Into<String>,
        deployment_environment_id: impl Into<String>,
        external_id: impl Into<String>,
        is_participating: bool,
    ) -> Self {
        Self {
            id: String::new(),
            flag_id: flag_id.into(),
            deployment_environment_id: deployment_environment_id.into(),
            external_id: external_id.into(),
            is_participating,
        }
    }
}

impl Entity for ReleasePilot {
    const KIND: EntityKind = EntityKind::ReleasePilot;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}
