//! Error types for the session and pool layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Nothing in this crate retries on its own: every variant is surfaced to the caller
//! that opened the scope, and `is_retryable` only classifies errors for callers that
//! implement their own retry policy.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error(
        "Connection record belongs to pid {owner_pid}, attempting to check out in pid {current_pid}"
    )]
    ForkSafetyViolation { owner_pid: u32, current_pid: u32 },

    #[error(
        "Read-only violation: {operation} through a slave session. Use a master session instead."
    )]
    ReadOnlyViolation { operation: String },

    #[error("Invalid post-commit hook '{hook}': {reason}")]
    InvalidHook { hook: String, reason: String },

    #[error("Transaction {stage} failed: {message}")]
    Transaction {
        stage: TransactionStage,
        message: String,
    },

    #[error("Rollback failed ({rollback}) while handling: {original}")]
    RollbackFailed {
        original: Box<DbError>,
        #[source]
        rollback: Box<DbError>,
    },

    #[error("Session must be rolled back after a failed flush: {reason}")]
    PendingRollback { reason: String },

    #[error("Scope aborted: {reason}")]
    Aborted { reason: String },

    #[error("Database layer is not initialized in this process")]
    NotInitialized,
}

/// Stage of transaction finalization that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    Begin,
    Commit,
    Rollback,
}

impl std::fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn fork_safety_violation(owner_pid: u32, current_pid: u32) -> Self {
        Self::ForkSafetyViolation {
            owner_pid,
            current_pid,
        }
    }

    /// Create a read-only violation for a write attempted through a slave session.
    pub fn read_only_violation(operation: impl Into<String>) -> Self {
        Self::ReadOnlyViolation {
            operation: operation.into(),
        }
    }

    pub fn invalid_hook(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHook {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a failure raised while finalizing a transaction.
    pub fn transaction(stage: TransactionStage, source: DbError) -> Self {
        match source {
            // Already classified, keep the original stage.
            err @ Self::Transaction { .. } => err,
            other => Self::Transaction {
                stage,
                message: other.to_string(),
            },
        }
    }

    /// Chain the error that aborted a scope with the rollback failure it triggered.
    pub fn rollback_failed(original: DbError, rollback: DbError) -> Self {
        Self::RollbackFailed {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    pub fn pending_rollback(reason: impl Into<String>) -> Self {
        Self::PendingRollback {
            reason: reason.into(),
        }
    }

    /// Abort the current scope from caller code; triggers a rollback when outermost.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is a transport-level failure an outer policy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// The error that originally aborted the scope, looking through rollback chaining.
    pub fn original(&self) -> &DbError {
        match self {
            Self::RollbackFailed { original, .. } => original.original(),
            other => other,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Acquire a fresh pool")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
