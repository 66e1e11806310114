//! Storage error types shared by source storages and cache storages.

use std::fmt;

use toggler_core::{CoreError, EntityKind};

/// Errors that can occur during storage operations.
///
/// A missing value is never an error on lookups; `find_*` operations report
/// absence through `Option`/empty streams. `NotFound` is raised only by point
/// mutations and by `find_by_ids` when a requested id no longer resolves.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested entity was not found.
    #[error("Entity not found: {entity_type}/{id}")]
    NotFound {
        /// The tag of the entity type that was not found.
        entity_type: String,
        /// The ID of the entity that was not found.
        id: String,
    },

    /// Attempted to create an entity that already exists.
    #[error("Entity already exists: {entity_type}/{id}")]
    AlreadyExists {
        /// The tag of the entity type that already exists.
        entity_type: String,
        /// The ID of the entity that already exists.
        id: String,
    },

    /// The entity data is invalid.
    #[error("Invalid entity: {message}")]
    InvalidEntity {
        /// Description of why the entity is invalid.
        message: String,
    },

    /// An error occurred during a transaction.
    #[error("Transaction error: {message}")]
    TransactionError {
        /// Description of the transaction error.
        message: String,
    },

    /// Failed to talk to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// The request context was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The request context deadline passed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A background subscriber fell behind and missed events.
    #[error("Subscriber lagged behind, {skipped} events skipped")]
    Lagged {
        /// Number of events that were dropped.
        skipped: u64,
    },

    /// The storage was misconfigured or wired incorrectly.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: kind.tag().to_string(),
            id: id.into(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity_type: kind.tag().to_string(),
            id: id.into(),
        }
    }

    /// Creates a new `InvalidEntity` error.
    #[must_use]
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }

    /// Creates a new `TransactionError` error.
    #[must_use]
    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is an already exists error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns `true` if the request context was cancelled or timed out.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::InvalidEntity { .. } => ErrorCategory::Validation,
            Self::TransactionError { .. } => ErrorCategory::Transaction,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Cancelled | Self::DeadlineExceeded => ErrorCategory::Cancelled,
            Self::Lagged { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<CoreError> for StorageError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnregisteredKind(_) | CoreError::IncompleteRegistry { .. } => {
                Self::configuration(err.to_string())
            }
            other => Self::invalid_entity(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_entity(err.to_string())
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Entity not found.
    NotFound,
    /// Conflict (existence).
    Conflict,
    /// Validation error.
    Validation,
    /// Transaction-related error.
    Transaction,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Cancelled or timed out by the caller.
    Cancelled,
    /// Wiring or configuration defect.
    Configuration,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::Transaction => write!(f, "transaction"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found(EntityKind::ReleaseFlag, "123");
        assert_eq!(err.to_string(), "Entity not found: release_flag/123");

        let err = StorageError::already_exists(EntityKind::Token, "456");
        assert_eq!(err.to_string(), "Entity already exists: security_token/456");
    }

    #[test]
    fn test_error_predicates() {
        let err = StorageError::not_found(EntityKind::ReleaseFlag, "123");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert!(!err.is_cancelled());

        assert!(StorageError::Cancelled.is_cancelled());
        assert!(StorageError::DeadlineExceeded.is_cancelled());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found(EntityKind::ReleaseFlag, "1").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            StorageError::already_exists(EntityKind::ReleaseFlag, "1").category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::connection_error("refused").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(ErrorCategory::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_core_error_conversion() {
        let err: StorageError = CoreError::UnregisteredKind(EntityKind::Token).into();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err: StorageError = CoreError::invalid_entity("bad").into();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
