use thiserror::Error;

use crate::kind::EntityKind;

/// Core error types for Toggler entities.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown entity type tag: {0}")]
    UnknownEntityType(String),

    #[error("Entity kind mismatch: expected {expected}, found {actual}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("Entity kind {0} is not registered")]
    UnregisteredKind(EntityKind),

    #[error("Entity registry is incomplete, missing: {missing:?}")]
    IncompleteRegistry { missing: Vec<EntityKind> },

    #[error("Invalid entity data: {message}")]
    InvalidEntity { message: String },

    #[error("Invalid rollout plan: {message}")]
    InvalidPlan { message: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidEntity error
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }

    /// Create a new InvalidPlan error
    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::InvalidPlan {
            message: message.into(),
        }
    }

    /// Create a new UnknownEntityType error
    pub fn unknown_entity_type(tag: impl Into<String>) -> Self {
        Self::UnknownEntityType(tag.into())
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
