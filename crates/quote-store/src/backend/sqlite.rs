//! # SQLite Backend
//!
//! File-backed [`StorageBackend`] over a single `kv_store` table.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SQLite Backend                                     │
//! │                                                                         │
//! │  Process A ──┐                                                          │
//! │              │   SqlitePool (WAL)   ┌──────────────────────────────┐   │
//! │  Process B ──┼────────────────────► │ kv_store                      │   │
//! │              │                      │  key TEXT PRIMARY KEY         │   │
//! │  Process C ──┘                      │  value TEXT (JSON envelope)   │   │
//! │                                     │  updated_at TEXT              │   │
//! │                                     └──────────────────────────────┘   │
//! │                                                                         │
//! │  Writes from one process become visible to the others on their next    │
//! │  read. Nobody is notified; that is the broadcast bus's job.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why WAL Mode?
//! Readers never block the single writer, so several editor processes can
//! poll the same file while one of them saves.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::migrations;

// =============================================================================
// Configuration
// =============================================================================

/// SQLite backend configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = SqliteConfig::new("/path/to/quote-cache.db")
///     .quota_bytes(5 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or `:memory:`.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 4
    pub max_connections: u32,

    /// Connection timeout.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Upper bound on bytes stored in keys and values.
    /// Default: none
    pub quota_bytes: Option<u64>,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl SqliteConfig {
    /// Creates a configuration for the given file. The file is created if
    /// it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteConfig {
            database_path: path.into(),
            max_connections: 4,
            connect_timeout: Duration::from_secs(30),
            quota_bytes: None,
            run_migrations: true,
        }
    }

    /// Creates an in-memory configuration (for testing).
    pub fn in_memory() -> Self {
        SqliteConfig {
            database_path: PathBuf::from(":memory:"),
            // Each connection would get its own database
            max_connections: 1,
            connect_timeout: Duration::from_secs(5),
            quota_bytes: None,
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the byte quota.
    pub fn quota_bytes(mut self, quota: u64) -> Self {
        self.quota_bytes = Some(quota);
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

// =============================================================================
// Backend
// =============================================================================

/// [`StorageBackend`] over an SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    quota_bytes: Option<u64>,
}

impl SqliteBackend {
    /// Opens the pool and runs migrations (if enabled).
    pub async fn connect(config: SqliteConfig) -> StoreResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Opening SQLite store"
        );

        let connect_options = if config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                // Another process may hold the write lock briefly
                .busy_timeout(Duration::from_secs(5))
        };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout);
        if config.is_in_memory() {
            // Closing the last connection drops an in-memory database
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!(max_connections = config.max_connections, "SQLite pool created");

        if config.run_migrations {
            migrations::run_migrations(&pool).await?;
        }

        Ok(SqliteBackend {
            pool,
            quota_bytes: config.quota_bytes,
        })
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks that the database answers queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Closes the pool. Later operations fail.
    pub async fn close(&self) {
        info!("Closing SQLite store");
        self.pool.close().await;
    }

    async fn usage_excluding(&self, key: &str) -> StoreResult<u64> {
        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
            FROM kv_store
            WHERE key != ?1
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(used.max(0) as u64)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn write(&self, key: &str, value: &str) -> StoreResult<()> {
        if let Some(quota) = self.quota_bytes {
            let used = self.usage_excluding(key).await?;
            let needed = (key.len() + value.len()) as u64;
            if used + needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key FROM kv_store
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn usage_bytes(&self) -> StoreResult<u64> {
        let used: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0) FROM kv_store",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(used.max(0) as u64)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend = SqliteBackend::connect(SqliteConfig::in_memory()).await.unwrap();
        assert!(backend.health_check().await);

        backend.write("quote:a", "1").await.unwrap();
        backend.write("quote:a", "2").await.unwrap();
        backend.write("other:b", "3").await.unwrap();

        assert_eq!(backend.read("quote:a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(backend.keys_with_prefix("quote:").await.unwrap(), vec!["quote:a".to_string()]);
        assert!(backend.delete("quote:a").await.unwrap());
        assert!(!backend.delete("quote:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let backend = SqliteBackend::connect(SqliteConfig::new(&path)).await.unwrap();
        backend.write("k", "v").await.unwrap();
        backend.close().await;

        let reopened = SqliteBackend::connect(SqliteConfig::new(&path)).await.unwrap();
        assert_eq!(reopened.read("k").await.unwrap().as_deref(), Some("v"));

        let (total, applied) = migrations::migration_status(reopened.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_quota_rejects_oversized_write() {
        let backend = SqliteBackend::connect(SqliteConfig::in_memory().quota_bytes(16))
            .await
            .unwrap();
        backend.write("k", "0123456789").await.unwrap();

        let err = backend.write("j", "0123456789").await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(backend.usage_bytes().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = SqliteConfig::new("/tmp/test.db").max_connections(2).quota_bytes(1024);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.quota_bytes, Some(1024));
        assert!(!config.is_in_memory());
        assert!(SqliteConfig::in_memory().is_in_memory());
    }
}
