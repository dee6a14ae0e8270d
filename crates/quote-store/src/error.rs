//! # Store Error Types
//!
//! Error types for backend operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  Backend error (sqlx::Error, quota check, ...)                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds categorization                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PersistentStore ← QuotaExceeded: evict expired, retry once            │
//! │       │             anything else: log and report `false` / `None`     │
//! │       ▼                                                                 │
//! │  EntityCache / SyncCoordinator never see a StoreError                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write would exceed the backend's capacity.
    ///
    /// ## When This Occurs
    /// - Memory backend byte quota reached
    /// - SQLite quota reached or `SQLITE_FULL` (disk full)
    #[error("Storage quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    /// Value could not be encoded or a stored record could not be decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Backend connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Internal backend error.
    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns true if evicting entries could make the write succeed.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// Convert sqlx errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// Database "13" / "database or disk is full"  → QuotaExceeded
/// Database (other)                            → QueryFailed
/// PoolTimedOut / PoolClosed                   → ConnectionFailed
/// Other                                       → Internal
/// ```
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                // SQLITE_FULL is result code 13
                let is_full = db_err.code().as_deref() == Some("13")
                    || db_err.message().contains("database or disk is full");
                if is_full {
                    StoreError::QuotaExceeded {
                        needed: 0,
                        available: 0,
                    }
                } else {
                    StoreError::QueryFailed(db_err.message().to_string())
                }
            }

            sqlx::Error::PoolTimedOut => {
                StoreError::ConnectionFailed("Connection pool timed out".to_string())
            }

            sqlx::Error::PoolClosed => StoreError::ConnectionFailed("Pool is closed".to_string()),

            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
