// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shardstore.
//!
//! Every backend failure is classified into a [`StoreError`] variant so callers can
//! decide between "retry the whole transaction", "treat as a conflicting write" and
//! "give up and surface the fault".

use sqlx::error::ErrorKind;
use thiserror::Error;
use tracing::warn;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

// PostgreSQL SQLSTATE codes that signal lock contention.
const PG_DEADLOCK_DETECTED: &str = "40P01";
const PG_SERIALIZATION_FAILURE: &str = "40001";
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
// statement_timeout fires as query_canceled.
const PG_QUERY_CANCELED: &str = "57014";

// SQLite primary and extended result codes.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";
const SQLITE_LOCKED_SHAREDCACHE: &str = "262";
const SQLITE_BUSY_RECOVERY: &str = "261";
const SQLITE_BUSY_SNAPSHOT: &str = "517";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Errors returned by store operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A key-based read matched zero rows.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of row that was looked up.
        entity: &'static str,
        /// Human-readable rendering of the key.
        key: String,
    },

    /// A write collided with another writer or violated a store invariant.
    #[error("conflict during '{operation}': {reason}")]
    Conflict {
        /// The operation that detected the conflict.
        operation: String,
        /// What collided.
        reason: String,
    },

    /// The engine reported a deadlock, serialization failure or lock wait timeout.
    #[error("lock contention during '{operation}': {details}")]
    LockContention {
        /// The operation that was blocked.
        operation: String,
        /// Engine message.
        details: String,
    },

    /// A statement or caller deadline elapsed.
    #[error("operation '{operation}' timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Connection-level failure (pool exhausted, socket closed, TLS).
    #[error("transient failure during '{operation}': {details}")]
    Transient {
        /// The operation in flight.
        operation: String,
        /// Underlying error text.
        details: String,
    },

    /// A stored record could not be decoded.
    #[error("encoding error in '{field}': {details}")]
    Encoding {
        /// Column or record field that failed to decode.
        field: String,
        /// Why decoding failed.
        details: String,
    },

    /// The caller passed an argument the store refuses to act on.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// Offending argument.
        field: String,
        /// Validation message.
        message: String,
    },

    /// A record for one shard was handed to a transaction opened on another.
    #[error("shard mismatch: transaction owns shard {expected}, record belongs to shard {actual}")]
    ShardMismatch {
        /// Shard the transaction was opened for.
        expected: i32,
        /// Shard carried by the record.
        actual: i32,
    },

    /// Any other database failure.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transient { .. } => "TRANSIENT",
            Self::Encoding { .. } => "ENCODING",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::ShardMismatch { .. } => "SHARD_MISMATCH",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the caller should re-run the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. } | Self::Timeout { .. } | Self::Transient { .. }
        )
    }

    /// Shorthand for a [`StoreError::NotFound`].
    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Shorthand for a [`StoreError::Conflict`].
    pub fn conflict(operation: &str, reason: impl Into<String>) -> Self {
        Self::Conflict {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`StoreError::Encoding`].
    pub fn encoding(field: &str, details: impl Into<String>) -> Self {
        Self::Encoding {
            field: field.to_string(),
            details: details.into(),
        }
    }

    /// Shorthand for a [`StoreError::Validation`].
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Classify a sqlx error raised while running `operation`.
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        let operation = operation.to_string();
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row",
                key: operation,
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                Self::Transient {
                    operation,
                    details: err.to_string(),
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                Self::Transient {
                    operation,
                    details: err.to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Encoding {
                field: operation,
                details: err.to_string(),
            },
            sqlx::Error::Database(ref db_err) => {
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                let message = db_err.message().to_string();

                if matches!(db_err.kind(), ErrorKind::UniqueViolation)
                    || code == SQLITE_CONSTRAINT_UNIQUE
                    || code == SQLITE_CONSTRAINT_PRIMARYKEY
                {
                    warn!(operation = %operation, code = %code, "Unique constraint violation");
                    return Self::Conflict {
                        operation,
                        reason: format!("duplicate key: {}", message),
                    };
                }

                match code.as_str() {
                    PG_DEADLOCK_DETECTED
                    | PG_SERIALIZATION_FAILURE
                    | PG_LOCK_NOT_AVAILABLE
                    | SQLITE_BUSY
                    | SQLITE_LOCKED
                    | SQLITE_LOCKED_SHAREDCACHE
                    | SQLITE_BUSY_RECOVERY
                    | SQLITE_BUSY_SNAPSHOT => {
                        warn!(operation = %operation, code = %code, "Lock contention");
                        Self::LockContention {
                            operation,
                            details: message,
                        }
                    }
                    PG_QUERY_CANCELED => Self::Timeout { operation },
                    _ => Self::Database {
                        operation,
                        details: format!("[{}] {}", code, message),
                    },
                }
            }
            other => Self::Database {
                operation,
                details: other.to_string(),
            },
        }
    }
}

/// Adapter for `map_err` that tags a sqlx error with the operation name.
pub(crate) fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| StoreError::from_sqlx(operation, err)
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from_sqlx("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding {
            field: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (StoreError::not_found("execution", "1/d/w/r"), "NOT_FOUND"),
            (StoreError::conflict("insert", "dup"), "CONFLICT"),
            (
                StoreError::LockContention {
                    operation: "lock".to_string(),
                    details: "deadlock".to_string(),
                },
                "LOCK_CONTENTION",
            ),
            (
                StoreError::Timeout {
                    operation: "select".to_string(),
                },
                "TIMEOUT",
            ),
            (
                StoreError::Transient {
                    operation: "connect".to_string(),
                    details: "refused".to_string(),
                },
                "TRANSIENT",
            ),
            (StoreError::encoding("data_encoding", "bogus"), "ENCODING"),
            (
                StoreError::validation("page_size", "must be > 0"),
                "VALIDATION_ERROR",
            ),
            (
                StoreError::ShardMismatch {
                    expected: 1,
                    actual: 2,
                },
                "SHARD_MISMATCH",
            ),
            (
                StoreError::Database {
                    operation: "insert".to_string(),
                    details: "boom".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            StoreError::LockContention {
                operation: "x".to_string(),
                details: "y".to_string()
            }
            .is_retryable()
        );
        assert!(
            StoreError::Timeout {
                operation: "x".to_string()
            }
            .is_retryable()
        );
        assert!(
            StoreError::Transient {
                operation: "x".to_string(),
                details: "y".to_string()
            }
            .is_retryable()
        );
        assert!(!StoreError::conflict("x", "y").is_retryable());
        assert!(!StoreError::not_found("execution", "k").is_retryable());
        assert!(!StoreError::encoding("data", "bad").is_retryable());
        assert!(
            !StoreError::ShardMismatch {
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::not_found("current execution", "shard=1 domain=d workflow=w").to_string(),
            "current execution not found: shard=1 domain=d workflow=w"
        );
        assert_eq!(
            StoreError::ShardMismatch {
                expected: 3,
                actual: 4
            }
            .to_string(),
            "shard mismatch: transaction owns shard 3, record belongs to shard 4"
        );
        assert_eq!(
            StoreError::validation("page_size", "must be greater than zero").to_string(),
            "validation error for 'page_size': must be greater than zero"
        );
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let err = StoreError::from_sqlx("get_execution", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_from_sqlx_pool_errors_are_transient() {
        let err = StoreError::from_sqlx("begin", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Transient { .. }));
        assert!(err.is_retryable());

        let err = StoreError::from_sqlx("begin", sqlx::Error::PoolClosed);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_sqlx_io_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StoreError::from_sqlx("select_tasks", sqlx::Error::Io(io));
        assert_eq!(err.error_code(), "TRANSIENT");
    }

    #[test]
    fn test_serde_json_error_is_encoding() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StoreError = json_err.into();
        assert_eq!(err.error_code(), "ENCODING");
    }
}
