//! Database error types and classification
//!
//! Raw SQLx errors are mapped onto a small closed set of [`ErrorKind`]s.
//! The kind decides whether a failed call may be retried: deterministic
//! outcomes (missing rows, constraint violations, bad input) are final,
//! while aborted transactions and unrecognized failures are presumed
//! transient.

use domain_billing::BillingError;
use thiserror::Error;

/// PostgreSQL `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL `foreign_key_violation`
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// PostgreSQL `in_failed_sql_transaction`
pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

const TRANSACTION_ABORTED_MESSAGE: &str = "current transaction is aborted";

/// Semantic classification of a failed storage call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    ForeignKeyViolation,
    TransactionAborted,
    InvalidInput,
    Unknown,
}

impl ErrorKind {
    /// Returns true if a call failing with this kind may succeed on retry
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransactionAborted | ErrorKind::Unknown)
    }
}

/// Classifies a raw SQLx error
///
/// Never fails; anything unrecognized is [`ErrorKind::Unknown`].
pub fn classify(error: &sqlx::Error) -> ErrorKind {
    match error {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db_err) => {
            classify_database_code(db_err.code().as_deref(), db_err.message())
        }
        other if other.to_string().contains(TRANSACTION_ABORTED_MESSAGE) => {
            ErrorKind::TransactionAborted
        }
        _ => ErrorKind::Unknown,
    }
}

/// Classifies a database-reported SQLSTATE code and message
pub fn classify_database_code(code: Option<&str>, message: &str) -> ErrorKind {
    if code == Some(IN_FAILED_SQL_TRANSACTION) || message.contains(TRANSACTION_ABORTED_MESSAGE) {
        return ErrorKind::TransactionAborted;
    }
    match code {
        Some(UNIQUE_VIOLATION) => ErrorKind::Duplicate,
        Some(FOREIGN_KEY_VIOLATION) => ErrorKind::ForeignKeyViolation,
        _ => ErrorKind::Unknown,
    }
}

/// Errors that can occur during database operations
///
/// Each variant corresponds to one [`ErrorKind`]; [`DatabaseError::Unknown`]
/// keeps the underlying SQLx error and SQLSTATE code for diagnostics.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Entity not found in database
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Unique constraint violation
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// Foreign key constraint violation
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// The surrounding transaction was aborted
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Identifier is not positive
    #[error("Invalid id: {0}")]
    InvalidId(i64),

    /// A required value was absent
    #[error("Missing value: {0}")]
    MissingValue(&'static str),

    /// Input failed domain validation
    #[error("Invalid input: {0}")]
    Invalid(#[from] BillingError),

    /// Failed to establish a database connection
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// Migration error
    #[error("Migration failed: {0}")]
    MigrationFailed(#[from] sqlx::migrate::MigrateError),

    /// Unrecognized database failure
    #[error("Database error [{}]: {source}", .code.as_deref().unwrap_or("-"))]
    Unknown {
        code: Option<String>,
        #[source]
        source: sqlx::Error,
    },
}

impl DatabaseError {
    /// Creates a not found error for a specific entity type and identifier
    ///
    /// # Arguments
    ///
    /// * `entity` - The type of entity (e.g., "Subscription")
    /// * `id` - The identifier that was not found
    ///
    /// # Example
    ///
    /// ```rust
    /// use infra_db::DatabaseError;
    ///
    /// let error = DatabaseError::not_found("Subscription", 42);
    /// assert!(error.to_string().contains("Subscription"));
    /// ```
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        DatabaseError::NotFound(format!("{} with id '{}' not found", entity, id))
    }

    /// The semantic kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::NotFound(_) => ErrorKind::NotFound,
            DatabaseError::DuplicateEntry(_) => ErrorKind::Duplicate,
            DatabaseError::ForeignKeyViolation(_) => ErrorKind::ForeignKeyViolation,
            DatabaseError::TransactionAborted(_) => ErrorKind::TransactionAborted,
            DatabaseError::InvalidId(_)
            | DatabaseError::MissingValue(_)
            | DatabaseError::Invalid(_) => ErrorKind::InvalidInput,
            DatabaseError::ConnectionFailed(_)
            | DatabaseError::MigrationFailed(_)
            | DatabaseError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Returns true if a retry may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Checks if this error indicates a record was not found
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Checks if this error is a constraint violation
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Duplicate | ErrorKind::ForeignKeyViolation
        )
    }
}

/// Converts SQLx errors to the matching DatabaseError variant
///
/// The mapping follows [`classify`]; unrecognized errors keep their
/// SQLSTATE code, when the database reported one.
impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        let message = match &error {
            sqlx::Error::Database(db_err) => db_err.message().to_string(),
            other => other.to_string(),
        };

        match classify(&error) {
            ErrorKind::NotFound => DatabaseError::NotFound(message),
            ErrorKind::Duplicate => DatabaseError::DuplicateEntry(message),
            ErrorKind::ForeignKeyViolation => DatabaseError::ForeignKeyViolation(message),
            ErrorKind::TransactionAborted => DatabaseError::TransactionAborted(message),
            ErrorKind::InvalidInput | ErrorKind::Unknown => {
                let code = match &error {
                    sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
                    _ => None,
                };
                DatabaseError::Unknown {
                    code,
                    source: error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TransactionAborted.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());

        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Duplicate,
            ErrorKind::ForeignKeyViolation,
            ErrorKind::InvalidInput,
        ] {
            assert!(!kind.is_retryable(), "{:?} should be final", kind);
        }
    }

    #[test]
    fn test_transaction_aborted_takes_priority_over_code() {
        let kind = classify_database_code(
            Some(UNIQUE_VIOLATION),
            "current transaction is aborted, commands ignored until end of transaction block",
        );
        assert_eq!(kind, ErrorKind::TransactionAborted);
    }
}
