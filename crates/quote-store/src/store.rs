//! # Persistent Store
//!
//! Namespaced key/value store with TTL and quota recovery on top of any
//! [`StorageBackend`].
//!
//! ## Record Layout
//! ```text
//! key:    "<namespace>:<caller key>"          e.g. "quote:quotation:q-1"
//! value:  { "value": <caller JSON>, "expiresAt": 1700000060000 }
//!                                              └─ omitted when no TTL
//! ```
//!
//! ## Write Path
//! ```text
//!  set(key, value, ttl)
//!       │
//!       ├── encode envelope ───────── fails ──► false
//!       │
//!       ▼
//!  backend.write ── ok ─────────────────────────► true
//!       │
//!       └── QuotaExceeded
//!              │
//!              ▼
//!         evict_expired()   (once)
//!              │
//!              ▼
//!         backend.write ── ok ──► true
//!              └────────── err ─► false
//! ```
//!
//! Nothing in this module returns an error to the caller. Failures are
//! logged and reported as `false`, `None` or an empty list.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use quote_core::validation::validate_namespace;
use quote_core::{Clock, SystemClock, DEFAULT_NAMESPACE};

use crate::backend::{MemoryBackend, StorageBackend};
use crate::error::{StoreError, StoreResult};

/// Stored wrapper around every value.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<V> {
    value: V,

    /// Expiry in milliseconds since the UNIX epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

/// Namespaced key/value store.
///
/// Cheap to clone; clones share the backend and clock.
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("namespace", &self.namespace)
            .field("backend", &self.backend)
            .finish()
    }
}

impl PersistentStore {
    /// Creates a store over `backend` using `namespace` as key prefix.
    ///
    /// An invalid namespace falls back to [`DEFAULT_NAMESPACE`].
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        if let Err(e) = validate_namespace(&namespace) {
            warn!(namespace = %namespace, error = %e, "Invalid namespace, using default");
            namespace = DEFAULT_NAMESPACE.to_string();
        }

        PersistentStore {
            backend,
            namespace,
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), DEFAULT_NAMESPACE)
    }

    /// Replaces the clock used for TTL checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the key namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the clock used for TTL checks.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Writes `value` under `key`, optionally expiring after `ttl`.
    ///
    /// On a quota failure, evicts expired entries once and retries once.
    pub async fn set<V: Serialize>(&self, key: &str, value: &V, ttl: Option<Duration>) -> bool {
        let full_key = self.full_key(key);

        let raw = match self.encode(value, ttl) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Failed to encode value");
                return false;
            }
        };

        match self.backend.write(&full_key, &raw).await {
            Ok(()) => true,
            Err(e) if e.is_quota() => {
                let evicted = self.evict_expired().await;
                info!(key = %full_key, evicted, "Quota exceeded, retrying after eviction");

                match self.backend.write(&full_key, &raw).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(key = %full_key, error = %e, "Write failed after eviction");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Write failed");
                false
            }
        }
    }

    /// Reads `key`.
    ///
    /// An expired entry is deleted and reported as absent. A record that
    /// can't be decoded as `V` is reported as absent and left in place.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let full_key = self.full_key(key);

        let envelope = match self.read_envelope(&full_key).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Unreadable record, treating as miss");
                return None;
            }
        };

        if self.is_expired(&envelope) {
            debug!(key = %full_key, "Entry expired, deleting");
            if let Err(e) = self.backend.delete(&full_key).await {
                warn!(key = %full_key, error = %e, "Failed to delete expired entry");
            }
            return None;
        }

        match serde_json::from_value(envelope.value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %full_key, error = %e, "Malformed record, treating as miss");
                None
            }
        }
    }

    /// Deletes `key`. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        match self.backend.delete(&full_key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Delete failed");
                false
            }
        }
    }

    /// Lists keys starting with `prefix`, without the namespace.
    pub async fn list_keys_by_prefix(&self, prefix: &str) -> Vec<String> {
        let full_prefix = self.full_key(prefix);
        match self.backend.keys_with_prefix(&full_prefix).await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| self.strip_namespace(&k).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(prefix = %full_prefix, error = %e, "Key listing failed");
                Vec::new()
            }
        }
    }

    /// Deletes every key starting with `prefix`. Returns the count deleted.
    pub async fn remove_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for key in self.list_keys_by_prefix(prefix).await {
            if self.remove(&key).await {
                removed += 1;
            }
        }
        debug!(prefix = %prefix, removed, "Removed keys by prefix");
        removed
    }

    /// Deletes every expired entry in this namespace. Returns the count.
    pub async fn evict_expired(&self) -> usize {
        let ns_prefix = self.full_key("");
        let keys = match self.backend.keys_with_prefix(&ns_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Eviction scan failed");
                return 0;
            }
        };

        let mut evicted = 0;
        for key in keys {
            let expired = matches!(
                self.read_envelope(&key).await,
                Ok(Some(ref envelope)) if self.is_expired(envelope)
            );
            if expired && matches!(self.backend.delete(&key).await, Ok(true)) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "Evicted expired entries");
        }
        evicted
    }

    /// Bytes used by the backend, 0 if unknown.
    pub async fn usage_bytes(&self) -> u64 {
        self.backend.usage_bytes().await.unwrap_or(0)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn strip_namespace<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        full_key
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }

    fn encode<V: Serialize>(&self, value: &V, ttl: Option<Duration>) -> StoreResult<String> {
        let expires_at = ttl.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            self.clock.now_ms().saturating_add(ttl_ms)
        });
        let envelope = Envelope { value, expires_at };
        Ok(serde_json::to_string(&envelope)?)
    }

    async fn read_envelope(&self, full_key: &str) -> StoreResult<Option<Envelope<serde_json::Value>>> {
        let Some(raw) = self.backend.read(full_key).await? else {
            return Ok(None);
        };
        let envelope = serde_json::from_str(&raw).map_err(StoreError::from)?;
        Ok(Some(envelope))
    }

    fn is_expired<V>(&self, envelope: &Envelope<V>) -> bool {
        envelope
            .expires_at
            .is_some_and(|at| at <= self.clock.now_ms())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quote_core::ManualClock;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn store_with_clock() -> (PersistentStore, MemoryBackend, ManualClock) {
        let backend = MemoryBackend::new();
        let clock = ManualClock::default();
        let store = PersistentStore::new(Arc::new(backend.clone()), "test")
            .with_clock(Arc::new(clock.clone()));
        (store, backend, clock)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let (store, _, _) = store_with_clock();
        assert!(store.set("a", &json!({ "n": 1 }), None).await);

        let value: Option<serde_json::Value> = store.get("a").await;
        assert_eq!(value, Some(json!({ "n": 1 })));

        assert!(store.remove("a").await);
        assert!(!store.remove("a").await);
        assert_eq!(store.get::<serde_json::Value>("a").await, None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_deletes_entry() {
        let (store, backend, clock) = store_with_clock();
        assert!(store.set("t", &"v", Some(Duration::from_secs(60))).await);

        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(store.get::<String>("t").await.as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.get::<String>("t").await, None);
        assert!(backend.is_empty(), "expired entry should be physically deleted");
    }

    #[tokio::test]
    async fn test_quota_failure_evicts_then_retries() {
        let (store, backend, clock) = store_with_clock();

        assert!(store.set("old", &"x".repeat(40), Some(Duration::from_secs(1))).await);
        let used = backend.usage_bytes().await.unwrap();
        backend.set_quota(Some(used + 10));

        // Doesn't fit while "old" is alive
        assert!(!store.set("new", &"y".repeat(40), None).await);

        clock.advance(chrono::Duration::seconds(2));
        assert!(store.set("new", &"y".repeat(40), None).await);
        assert_eq!(store.list_keys_by_prefix("").await, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_unencodable_value_reports_false() {
        let (store, backend, _) = store_with_clock();
        // Non-string map keys can't be encoded as JSON
        let mut bad: BTreeMap<(u8, u8), u8> = BTreeMap::new();
        bad.insert((1, 2), 3);

        assert!(!store.set("bad", &bad, None).await);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_is_a_miss() {
        let (store, backend, _) = store_with_clock();
        backend.insert_raw("test:broken", "{not json");
        assert_eq!(store.get::<serde_json::Value>("broken").await, None);

        assert!(store.set("num", &5, None).await);
        assert_eq!(store.get::<String>("num").await, None);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let a = PersistentStore::new(backend.clone(), "a");
        let b = PersistentStore::new(backend.clone(), "b");

        assert!(a.set("k", &1, None).await);
        assert_eq!(b.get::<i32>("k").await, None);
        assert_eq!(a.list_keys_by_prefix("").await, vec!["k".to_string()]);
        assert!(b.list_keys_by_prefix("").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_prefix() {
        let (store, _, _) = store_with_clock();
        for key in ["quotation:1", "quotation:2", "snapshot_list:1"] {
            assert!(store.set(key, &key, None).await);
        }

        assert_eq!(store.remove_by_prefix("quotation:").await, 2);
        assert_eq!(store.list_keys_by_prefix("").await, vec!["snapshot_list:1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_namespace_falls_back() {
        let store = PersistentStore::new(Arc::new(MemoryBackend::new()), "has space");
        assert_eq!(store.namespace(), DEFAULT_NAMESPACE);
    }
}
