use domain::{EntityKind, LedgerError};
use thiserror::Error;

/// Postgres error codes that signal contention rather than a real failure.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Errors that can occur when interacting with the ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation violated a ledger rule and was rolled back.
    #[error(transparent)]
    Rejected(#[from] LedgerError),

    /// The operation lost a race for an entity and was rolled back.
    /// Retrying it may succeed.
    #[error("Transaction conflict on {entity}: {reason}")]
    Conflict { entity: String, reason: String },

    /// An administrative insert collided with an existing entity.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: EntityKind, id: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is outside the range the ledger accepts.
    #[error("Corrupt value in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

impl StoreError {
    /// Returns true if the error came from contention and the whole
    /// operation can safely be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub(crate) fn conflict(entity: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        StoreError::Conflict {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err
            && matches!(
                db_err.code().as_deref(),
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE)
            )
        {
            return StoreError::Conflict {
                entity: db_err.table().unwrap_or("database").to_string(),
                reason: db_err.message().to_string(),
            };
        }
        StoreError::Database(err)
    }
}

/// Result type for ledger store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_transient() {
        assert!(StoreError::conflict("account", "lock wait").is_transient());
        assert!(!StoreError::Rejected(LedgerError::InvalidEventId).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn rejected_is_displayed_verbatim() {
        let err = StoreError::from(LedgerError::InvalidEventId);
        assert_eq!(err.to_string(), LedgerError::InvalidEventId.to_string());
    }
}
