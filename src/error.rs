//! Error types shared by the flush pipeline, plugins and backends.

use crate::broker::BrokerError;
use crate::storage::DatabaseError;

/// Result type for ORM operations.
pub type Result<T> = std::result::Result<T, OrmError>;

/// Errors surfaced by the engine, the flush pipeline and plugins.
#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    /// Registry or schema definition problem. Fatal, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity {entity} is not loaded")]
    NotLoaded { entity: String },

    #[error("Track limit exceeded: flusher accepts at most {limit} entities")]
    TrackLimitExceeded { limit: usize },

    #[error("Duplicate entry '{value}' for key '{index}'")]
    DuplicateKey { index: String, value: String },

    #[error("Foreign key constraint '{constraint}' failed")]
    ForeignKey { constraint: String },

    #[error("Unknown value '{value}' for field {field}")]
    EnumUnknown { field: String, value: String },

    #[error("Transaction error: {0}")]
    TransactionState(String),

    #[error("Plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    #[error("Unregistered entity: {0}")]
    UnregisteredEntity(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrmError {
    /// Whether retrying the same operation later might succeed.
    ///
    /// Transient: lock wait timeouts, deadlocks, lost or refused
    /// connections, and broker connectivity.
    pub fn is_transient(&self) -> bool {
        match self {
            OrmError::Database(e) => e.is_transient(),
            OrmError::Broker(e) => e.is_transient(),
            _ => false,
        }
    }

    /// The key violation carried by this error, if any.
    pub fn key_violation(&self) -> Option<KeyViolation> {
        match self {
            OrmError::DuplicateKey { index, value } => Some(KeyViolation::DuplicateKey {
                index: index.clone(),
                value: value.clone(),
            }),
            OrmError::ForeignKey { constraint } => Some(KeyViolation::ForeignKey {
                constraint: constraint.clone(),
            }),
            _ => None,
        }
    }
}

impl From<::config::ConfigError> for OrmError {
    fn from(e: ::config::ConfigError) -> Self {
        OrmError::Config(e.to_string())
    }
}

/// Key violation returned as a value by `flush_with_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyViolation {
    /// A unique index rejected the row.
    DuplicateKey { index: String, value: String },
    /// A foreign key constraint rejected the row.
    ForeignKey { constraint: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_is_key_violation() {
        let err = OrmError::DuplicateKey {
            index: "UserEntity.Name".to_string(),
            value: "Tom".to_string(),
        };
        assert_eq!(
            err.key_violation(),
            Some(KeyViolation::DuplicateKey {
                index: "UserEntity.Name".to_string(),
                value: "Tom".to_string()
            })
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_validation_is_not_key_violation() {
        let err = OrmError::Validation("bad".to_string());
        assert!(err.key_violation().is_none());
    }

    #[test]
    fn test_deadlock_is_transient() {
        let err = OrmError::Database(DatabaseError::Server {
            code: 1213,
            message: "Deadlock found".to_string(),
        });
        assert!(err.is_transient());
    }

    #[test]
    fn test_duplicate_server_error_is_not_transient() {
        let err = OrmError::Database(DatabaseError::Server {
            code: 1062,
            message: "Duplicate entry".to_string(),
        });
        assert!(!err.is_transient());
    }
}
