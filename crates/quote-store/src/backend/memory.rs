//! # Memory Backend
//!
//! A map behind a mutex. Clones share the same map, which is how tests
//! model several processes reading and writing one physical store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::StorageBackend;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<u64>,
}

impl Inner {
    fn usage(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// In-memory [`StorageBackend`] with an optional byte quota.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    /// Creates an unbounded backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that rejects writes once keys and values exceed
    /// `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        let backend = Self::default();
        backend.set_quota(Some(quota_bytes));
        backend
    }

    /// Changes the quota; `None` removes it. Existing entries are kept.
    pub fn set_quota(&self, quota_bytes: Option<u64>) {
        self.lock().quota_bytes = quota_bytes;
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Writes a raw value, bypassing the quota. Used to plant corrupt or
    /// foreign records.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().entries.insert(key.into(), value.into());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn write(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock();

        if let Some(quota) = inner.quota_bytes {
            let replaced = inner
                .entries
                .get(key)
                .map(|old| entry_size(key, old))
                .unwrap_or(0);
            let used = inner.usage() - replaced;
            let needed = entry_size(key, value);
            if used + needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        inner.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn read(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.lock().entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn usage_bytes(&self) -> StoreResult<u64> {
        Ok(self.lock().usage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing_is_ordered() {
        let backend = MemoryBackend::new();
        backend.write("a:2", "x").await.unwrap();
        backend.write("a:1", "x").await.unwrap();
        backend.write("b:1", "x").await.unwrap();

        let keys = backend.keys_with_prefix("a:").await.unwrap();
        assert_eq!(keys, vec!["a:1".to_string(), "a:2".to_string()]);
    }

    #[tokio::test]
    async fn test_quota_counts_replaced_entry_once() {
        let backend = MemoryBackend::with_quota(10);
        backend.write("k", "12345").await.unwrap(); // 6 bytes
        // Replacing the same key with 9 bytes total fits.
        backend.write("k", "12345678").await.unwrap();

        let err = backend.write("j", "1").await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(backend.usage_bytes().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let a = MemoryBackend::new();
        let b = a.clone();
        a.write("k", "v").await.unwrap();
        assert_eq!(b.read("k").await.unwrap().as_deref(), Some("v"));
        assert!(b.delete("k").await.unwrap());
        assert!(a.is_empty());
    }
}
