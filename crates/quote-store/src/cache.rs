//! # Entity Cache
//!
//! Dirty-tracking document cache over the [`PersistentStore`].
//!
//! ## Writes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  save(doc)              clean write   isDirty=false  status=synced      │
//! │  save_dirty(doc)        dirty write   isDirty=true   status=pending     │
//! │  save_server_copy(doc)  clean write + server version/time stamped      │
//! │                                                                         │
//! │  mark_synced            isDirty=false status=synced  server fields set  │
//! │  mark_sync_error        status=error (dirty only)    lastError kept     │
//! │  mark_conflict          isDirty=true  status=conflict                   │
//! │  mark_syncing           status=syncing, lastSyncAttempt=now             │
//! │  mark_offline           status=offline (dirty only)                     │
//! │  stamp_server_version   server fields set, dirty untouched              │
//! │                                                                         │
//! │  None of the mark_* operations touch `data`.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are `"<entity type>:<id>"` inside the store's namespace. Every
//! operation reads and writes the store directly; there is no in-process
//! copy, so a write from another process is seen on the next read.

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use quote_core::validation::validate_entity_id;
use quote_core::{CacheMetadata, CachedDocument, ServerDocument, SyncDocument, SyncStatus};

use crate::store::PersistentStore;

/// Document cache for one document type.
pub struct EntityCache<T> {
    store: PersistentStore,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        EntityCache {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: SyncDocument> fmt::Debug for EntityCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("store", &self.store)
            .finish()
    }
}

impl<T: SyncDocument> EntityCache<T> {
    /// Creates a cache over `store`.
    pub fn new(store: PersistentStore) -> Self {
        EntityCache {
            store,
            _marker: PhantomData,
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Writes a clean snapshot. Use only when `doc` equals the server copy.
    pub async fn save(&self, doc: &T) -> bool {
        if let Err(e) = validate_entity_id(doc.id()) {
            warn!(entity_type = T::ENTITY_TYPE, error = %e, "Refusing to cache document");
            return false;
        }

        let previous = self.get_with_meta(doc.id()).await.map(|c| c.metadata);
        let metadata = CacheMetadata::clean(self.now(), previous.as_ref());
        self.write(doc, metadata).await
    }

    /// Writes a dirty snapshot, keeping the known server version.
    ///
    /// This is the only entry point for local edits. Work in progress is
    /// kept as typed; only the id is checked, since it forms the key.
    pub async fn save_dirty(&self, doc: &T) -> bool {
        if let Err(e) = validate_entity_id(doc.id()) {
            warn!(entity_type = T::ENTITY_TYPE, error = %e, "Refusing to cache edit");
            return false;
        }

        let previous = self.get_with_meta(doc.id()).await.map(|c| c.metadata);
        let metadata = CacheMetadata::dirty(self.now(), previous.as_ref());
        self.write(doc, metadata).await
    }

    /// Writes a server document clean and stamps its version in one write.
    ///
    /// Equivalent to [`save`](Self::save) followed by
    /// [`mark_synced`](Self::mark_synced).
    pub async fn save_server_copy(&self, server: &ServerDocument<T>) -> bool {
        if let Err(e) = validate_entity_id(server.data.id()) {
            warn!(entity_type = T::ENTITY_TYPE, error = %e, "Refusing to cache server document");
            return false;
        }

        let previous = self.get_with_meta(server.data.id()).await.map(|c| c.metadata);
        let mut metadata = CacheMetadata::clean(self.now(), previous.as_ref());
        metadata.mark_synced(server.updated_at, server.version_number);
        self.write(&server.data, metadata).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the cached document.
    pub async fn get(&self, id: &str) -> Option<T> {
        self.get_with_meta(id).await.map(|c| c.data)
    }

    /// Returns the cached document with its metadata.
    pub async fn get_with_meta(&self, id: &str) -> Option<CachedDocument<T>> {
        self.store.get(&Self::key(id)).await
    }

    /// Returns true if the entity has local changes not on the server.
    pub async fn is_dirty(&self, id: &str) -> bool {
        self.get_with_meta(id)
            .await
            .map(|c| c.metadata.is_dirty)
            .unwrap_or(false)
    }

    /// Returns the entity's sync status, `None` if not cached.
    pub async fn get_sync_status(&self, id: &str) -> Option<SyncStatus> {
        self.get_with_meta(id).await.map(|c| c.metadata.sync_status)
    }

    /// Ids of every cached entity of this type.
    pub async fn list_ids(&self) -> Vec<String> {
        let prefix = Self::key("");
        self.store
            .list_keys_by_prefix(&prefix)
            .await
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect()
    }

    /// Ids of every cached entity with local changes.
    pub async fn dirty_ids(&self) -> Vec<String> {
        let mut dirty = Vec::new();
        for id in self.list_ids().await {
            if self.is_dirty(&id).await {
                dirty.push(id);
            }
        }
        dirty
    }

    // =========================================================================
    // Status Transitions
    // =========================================================================

    /// Clears dirty and stamps the server version. Idempotent.
    pub async fn mark_synced(&self, id: &str, server_updated_at: DateTime<Utc>, server_version: i64) -> bool {
        self.update_metadata(id, |m| m.mark_synced(server_updated_at, server_version))
            .await
    }

    /// Records a failed pull or push.
    pub async fn mark_sync_error(&self, id: &str, reason: Option<String>) -> bool {
        self.update_metadata(id, |m| m.mark_error(reason)).await
    }

    /// Moves the entity to `conflict`.
    pub async fn mark_conflict(&self, id: &str) -> bool {
        self.update_metadata(id, CacheMetadata::mark_conflict).await
    }

    /// Marks a push as in flight.
    pub async fn mark_syncing(&self, id: &str) -> bool {
        let now = self.now();
        self.update_metadata(id, |m| m.mark_syncing(now)).await
    }

    /// Marks a dirty entity as waiting for connectivity.
    pub async fn mark_offline(&self, id: &str) -> bool {
        self.update_metadata(id, CacheMetadata::mark_offline).await
    }

    /// Records a server version without clearing dirty.
    pub async fn stamp_server_version(
        &self,
        id: &str,
        server_updated_at: DateTime<Utc>,
        server_version: i64,
    ) -> bool {
        self.update_metadata(id, |m| {
            m.stamp_server_version(server_updated_at, server_version);
            // An edit that outlived a push is waiting for the next one
            if m.is_dirty && m.sync_status == SyncStatus::Syncing {
                m.sync_status = SyncStatus::Pending;
            }
        })
        .await
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Removes one entity.
    pub async fn remove(&self, id: &str) -> bool {
        self.store.remove(&Self::key(id)).await
    }

    /// Removes every entity of this type. Returns the count removed.
    pub async fn clear(&self) -> usize {
        self.store.remove_by_prefix(&Self::key("")).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn key(id: &str) -> String {
        format!("{}:{}", T::ENTITY_TYPE, id)
    }

    fn now(&self) -> DateTime<Utc> {
        self.store.clock().now()
    }

    async fn write(&self, doc: &T, metadata: CacheMetadata) -> bool {
        let record = CachedDocument {
            data: doc.clone(),
            metadata,
        };
        let ok = self.store.set(&Self::key(doc.id()), &record, None).await;
        if ok {
            debug!(
                entity_type = T::ENTITY_TYPE,
                entity_id = %doc.id(),
                status = %record.metadata.sync_status,
                dirty = record.metadata.is_dirty,
                "Cached document"
            );
        }
        ok
    }

    async fn update_metadata(&self, id: &str, apply: impl FnOnce(&mut CacheMetadata)) -> bool {
        let Some(mut cached) = self.get_with_meta(id).await else {
            debug!(entity_type = T::ENTITY_TYPE, entity_id = %id, "No cached entry to update");
            return false;
        };

        apply(&mut cached.metadata);
        self.store.set(&Self::key(id), &cached, None).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
