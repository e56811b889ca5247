//! Error types for identity-merge

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergeError {
    /// A person id does not resolve to a live person
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request itself cannot be honoured (same ids, authenticated source, ...)
    #[error("Invalid merge: {0}")]
    InvalidMerge(String),

    /// The database aborted the transaction because of a concurrent write
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    #[error("Merge abandoned after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// A reconciliation postcondition failed before commit
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MergeError {
    /// Map a diesel error with call-site context, classifying lock/busy
    /// failures as serialization conflicts so the coordinator retries them.
    pub fn db(context: &str, err: DieselError) -> Self {
        if is_serialization_failure(&err) {
            MergeError::SerializationConflict(format!("{}: {}", context, err))
        } else {
            MergeError::Database(format!("{}: {}", context, err))
        }
    }

    /// Whether the coordinator should restart the merge from `Resolving`
    pub fn is_retryable(&self) -> bool {
        matches!(self, MergeError::SerializationConflict(_))
    }
}

/// Raw diesel errors escaping a transaction (BEGIN/COMMIT/ROLLBACK failures)
impl From<DieselError> for MergeError {
    fn from(err: DieselError) -> Self {
        MergeError::db("Transaction failed", err)
    }
}

fn is_serialization_failure(err: &DieselError) -> bool {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => true,
        DieselError::DatabaseError(_, info) => {
            let message = info.message().to_ascii_lowercase();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || message.contains("busy")
        }
        _ => false,
    }
}

pub type MergeResult<T> = Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!MergeError::NotFound("p1".into()).is_retryable());
        assert!(!MergeError::IntegrityViolation("dup".into()).is_retryable());
    }

    #[test]
    fn test_serialization_conflict_is_retryable() {
        assert!(MergeError::SerializationConflict("locked".into()).is_retryable());
    }

    #[test]
    fn test_plain_diesel_error_maps_to_database() {
        let err = MergeError::db("Failed to load persons", DieselError::NotFound);
        match err {
            MergeError::Database(msg) => assert!(msg.starts_with("Failed to load persons")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
