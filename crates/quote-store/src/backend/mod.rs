//! # Storage Backends
//!
//! The raw key/value seam underneath [`PersistentStore`](crate::PersistentStore).
//!
//! Backends know nothing about namespaces, envelopes or expiry. They store
//! opaque strings under opaque keys and report capacity problems as
//! [`StoreError::QuotaExceeded`](crate::StoreError::QuotaExceeded).
//!
//! ```text
//! ┌──────────────────────┐      ┌────────────────────────────────────────┐
//! │   PersistentStore    │─────►│        dyn StorageBackend              │
//! │  namespace, TTL,     │      │                                        │
//! │  quota retry         │      │  MemoryBackend   shared map, quota     │
//! └──────────────────────┘      │  SqliteBackend   kv_store table, WAL   │
//!                               └────────────────────────────────────────┘
//! ```

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreResult;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::{SqliteBackend, SqliteConfig};

/// A physical key/value store.
///
/// Implementations must be safe to share between tasks; several
/// [`PersistentStore`](crate::PersistentStore) handles may point at one
/// backend to model processes sharing one physical store.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Inserts or replaces `key`.
    async fn write(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Reads `key`, `None` if absent.
    async fn read(&self, key: &str) -> StoreResult<Option<String>>;

    /// Deletes `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Lists every key starting with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Bytes currently used by keys and values.
    async fn usage_bytes(&self) -> StoreResult<u64>;
}
