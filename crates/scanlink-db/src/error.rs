//! # Database Error Types
//!
//! Error types for event store and identity operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds context and classification               │
//! │       │                                                                 │
//! │       ├──► append path: returned synchronously to the capture caller   │
//! │       │                                                                 │
//! │       └──► worker path: AgentError, logged, event left for next cycle  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use scanlink_core::{ErrorClass, ValidationError};
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Outstanding events reached the configured ceiling.
    ///
    /// ## When This Occurs
    /// - Hub unreachable for a long time and scanning continues
    /// - Device never provisioned
    ///
    /// The scan is not stored; the caller must surface this immediately.
    #[error("Event store full: {outstanding} outstanding events (capacity {capacity})")]
    StoreFull { outstanding: u64, capacity: u64 },

    /// Payload refused before insert.
    #[error("Invalid scan payload: {0}")]
    InvalidPayload(#[from] ValidationError),

    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A guarded state change matched no row.
    ///
    /// ## When This Occurs
    /// - `mark_delivered` on an event that is not IN_FLIGHT
    /// - Registration update that would move the state backwards
    #[error("{entity} {id} is not in state {expected}")]
    InvalidTransition {
        entity: String,
        id: String,
        expected: String,
    },

    /// Unique constraint violation.
    #[error("Duplicate {field}")]
    UniqueViolation { field: String },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file can't be created (permissions, read-only rootfs)
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: impl Into<String>,
        id: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        DbError::InvalidTransition {
            entity: entity.into(),
            id: id.into(),
            expected: expected.into(),
        }
    }

    /// Maps the error onto the failure taxonomy.
    ///
    /// Storage problems are local and transient unless the input itself
    /// was refused.
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::InvalidPayload(_) => ErrorClass::PermanentRejection,
            DbError::MigrationFailed(_) => ErrorClass::ConfigurationFatal,
            _ => ErrorClass::TransientLocal,
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → UniqueViolation or QueryFailed
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <table>.<column>"
                if let Some(field) = msg.strip_prefix("UNIQUE constraint failed: ") {
                    DbError::UniqueViolation {
                        field: field.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_full_is_transient_local() {
        let err = DbError::StoreFull {
            outstanding: 10,
            capacity: 10,
        };
        assert_eq!(err.class(), ErrorClass::TransientLocal);
        assert!(err.to_string().contains("capacity 10"));
    }

    #[test]
    fn test_invalid_payload_is_permanent() {
        let err: DbError = ValidationError::Required {
            field: "payload".to_string(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::PermanentRejection);
    }
}
