//! Entity fixtures for common scenarios.

use toggler_core::{
    DeploymentEnvironment, ReleaseFlag, ReleasePilot, ReleaseRollout, RolloutPlan, Token,
    new_entity_id,
};

/// A name that no other test will use.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", new_entity_id())
}

pub fn flag(name: impl Into<String>) -> ReleaseFlag {
    ReleaseFlag::new(name)
}

pub fn environment(name: impl Into<String>) -> DeploymentEnvironment {
    DeploymentEnvironment::new(name)
}

/// A rollout enrolling `percentage` percent of pilots.
pub fn percentage_rollout(flag_id: &str, environment_id: &str, percentage: u8) -> ReleaseRollout {
    ReleaseRollout::new(
        flag_id,
        environment_id,
        RolloutPlan::percentage(42, percentage),
    )
}

pub fn pilot(flag_id: &str, environment_id: &str, external_id: &str) -> ReleasePilot {
    ReleasePilot::new(flag_id, environment_id, external_id, true)
}

pub fn token(sha512: impl Into<String>) -> Token {
    Token::new(sha512, "owner-1")
}
