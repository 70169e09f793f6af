//! Error type shared by the partitioning components
//!
//! Precondition failures and lock exhaustion are always surfaced to the caller.
//! Drift that can be corrected in place never shows up here; it is logged instead.

use may_postgres::error::SqlState;
use may_postgres::Error as PostgresError;
use std::fmt;

/// Partitioning error type
#[derive(Debug)]
pub enum PartitionError {
    /// `PostgreSQL` error from `may_postgres`
    Postgres(PostgresError),
    /// Query execution error
    Query(String),
    /// Catalog data that could not be parsed (partition bounds, column defaults)
    Parse(String),
    /// The partitioning setup itself is invalid
    Configuration(String),
    /// The table cannot be converted into a partition in its current state
    UnableToPartition(String),
    /// Every attempt of a lock-retrying block timed out waiting for locks
    LockRetriesExhausted { attempts: usize, message: String },
    /// Detaching a partition would block on a foreign key check
    UnsafeToDetach(String),
    /// The partitioning key has no column default to compare against
    MissingDefaultValue { table: String, column: String, model: String },
    /// An operation needed the active partition of a table that has none
    NoPartitions(String),
    /// Transaction already committed or rolled back
    TransactionClosed,
    /// Other execution errors
    Other(String),
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            PartitionError::Query(s) => write!(f, "Query error: {s}"),
            PartitionError::Parse(s) => write!(f, "Parse error: {s}"),
            PartitionError::Configuration(s) => write!(f, "Configuration error: {s}"),
            PartitionError::UnableToPartition(s) => write!(f, "Unable to partition: {s}"),
            PartitionError::LockRetriesExhausted { attempts, message } => {
                write!(
                    f,
                    "Lock retries exhausted after {attempts} attempt(s): {message}\n\
                     Long-running transactions are holding conflicting locks. Retry the \
                     operation once they have finished."
                )
            }
            PartitionError::UnsafeToDetach(s) => write!(f, "Unsafe to detach partition: {s}"),
            PartitionError::MissingDefaultValue { table, column, model } => {
                write!(
                    f,
                    "No default value found for the {column} column of {table} within {model}"
                )
            }
            PartitionError::NoPartitions(table) => {
                write!(f, "Table {table} has no partitions")
            }
            PartitionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
            PartitionError::Other(s) => write!(f, "Execution error: {s}"),
        }
    }
}

impl std::error::Error for PartitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PartitionError::Postgres(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PostgresError> for PartitionError {
    fn from(err: PostgresError) -> Self {
        PartitionError::Postgres(err)
    }
}

impl PartitionError {
    /// Whether the error was raised because `lock_timeout` expired.
    ///
    /// Driver errors are matched on SQLSTATE 55P03; errors that only carry text fall
    /// back to the server message.
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            PartitionError::Postgres(e) => is_lock_not_available(e.code()),
            PartitionError::Query(message) | PartitionError::Other(message) => {
                message.contains("55P03") || message.contains("lock timeout")
            }
            _ => false,
        }
    }
}

fn is_lock_not_available(code: Option<&SqlState>) -> bool {
    code == Some(&SqlState::LOCK_NOT_AVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unable_to_partition_display() {
        let err = PartitionError::UnableToPartition("Table events is not ready".to_string());
        let display = err.to_string();
        assert!(display.contains("Unable to partition"));
        assert!(display.contains("Table events is not ready"));
    }

    #[test]
    fn test_lock_retries_exhausted_display() {
        let err = PartitionError::LockRetriesExhausted {
            attempts: 3,
            message: "ALTER TABLE events".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("3 attempt(s)"));
        assert!(display.contains("ALTER TABLE events"));
    }

    #[test]
    fn test_missing_default_value_display() {
        let err = PartitionError::MissingDefaultValue {
            table: "events".to_string(),
            column: "created_shard".to_string(),
            model: "Event".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No default value found for the created_shard column of events within Event"
        );
    }

    #[test]
    fn test_is_lock_timeout() {
        assert!(PartitionError::Query("canceling statement due to lock timeout".into())
            .is_lock_timeout());
        assert!(PartitionError::Other("ERROR 55P03".into()).is_lock_timeout());
        assert!(!PartitionError::Query("syntax error at or near".into()).is_lock_timeout());
        // Precondition failures never count as lock contention, whatever they say.
        assert!(!PartitionError::UnableToPartition("lock timeout".into()).is_lock_timeout());
    }

    #[test]
    fn test_driver_errors_match_on_sqlstate() {
        assert!(is_lock_not_available(Some(&SqlState::LOCK_NOT_AVAILABLE)));
        assert!(!is_lock_not_available(Some(&SqlState::SYNTAX_ERROR)));
        assert!(!is_lock_not_available(None));
    }
}
