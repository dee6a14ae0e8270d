//! In-memory server of record.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use quote_core::{Clock, ServerDocument, SyncDocument, SystemClock};

use super::RemoteDocuments;
use crate::error::{SyncError, SyncResult};

struct State<T> {
    docs: HashMap<String, ServerDocument<T>>,
    offline: bool,
    failing: bool,
    fetches: u64,
    stores: u64,
}

/// Server of record held in memory.
///
/// Clones share the same documents, so one instance can stand behind
/// several simulated processes.
pub struct InMemoryRemote<T> {
    state: Arc<Mutex<State<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for InMemoryRemote<T> {
    fn clone(&self) -> Self {
        InMemoryRemote {
            state: self.state.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<T: SyncDocument> fmt::Debug for InMemoryRemote<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryRemote")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("documents", &state.docs.len())
            .field("offline", &state.offline)
            .field("failing", &state.failing)
            .finish()
    }
}

impl<T: SyncDocument> Default for InMemoryRemote<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SyncDocument> InMemoryRemote<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        InMemoryRemote {
            state: Arc::new(Mutex::new(State {
                docs: HashMap::new(),
                offline: false,
                failing: false,
                fetches: 0,
                stores: 0,
            })),
            clock,
        }
    }

    /// Places `doc` on the server at exactly `version`.
    pub fn seed(&self, doc: T, version: i64) -> ServerDocument<T> {
        let server = ServerDocument {
            data: doc,
            updated_at: self.clock.now(),
            version_number: version,
        };
        self.lock()
            .docs
            .insert(server.data.id().to_string(), server.clone());
        server
    }

    /// Returns the server copy without counting a fetch.
    pub fn document(&self, id: &str) -> Option<ServerDocument<T>> {
        self.lock().docs.get(id).cloned()
    }

    /// Makes every request fail as unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Makes every request fail with HTTP 500.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Number of fetch requests served.
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetches
    }

    /// Number of accepted writes.
    pub fn store_count(&self) -> u64 {
        self.lock().stores
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(state: &State<T>) -> SyncResult<()> {
        if state.offline {
            return Err(SyncError::ConnectionFailed("server unreachable".into()));
        }
        if state.failing {
            return Err(SyncError::ServerStatus {
                status: 500,
                message: "internal server error".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<T: SyncDocument> RemoteDocuments<T> for InMemoryRemote<T> {
    async fn fetch(&self, id: &str) -> SyncResult<ServerDocument<T>> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.fetches += 1;

        state
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                entity_type: T::ENTITY_TYPE.to_string(),
                id: id.to_string(),
            })
    }

    async fn store(&self, doc: &T, expected_version: i64) -> SyncResult<ServerDocument<T>> {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::check_available(&state)?;

        let current = state
            .docs
            .get(doc.id())
            .map(|d| d.version_number)
            .unwrap_or(0);

        if expected_version < current {
            return Err(SyncError::VersionMismatch {
                entity_id: doc.id().to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        let stored = ServerDocument {
            data: doc.clone(),
            updated_at: now,
            version_number: current + 1,
        };
        state.docs.insert(doc.id().to_string(), stored.clone());
        state.stores += 1;

        debug!(
            entity_type = T::ENTITY_TYPE,
            entity_id = %doc.id(),
            version = stored.version_number,
            "Server stored document"
        );
        Ok(stored)
    }

    async fn ping(&self) -> SyncResult<()> {
        Self::check_available(&self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote_core::Quotation;

    #[tokio::test]
    async fn test_versions_increase() {
        let remote = InMemoryRemote::<Quotation>::new();
        let q = Quotation::new("Q-1", "Title", "Acme");

        let v1 = remote.store(&q, 0).await.unwrap();
        assert_eq!(v1.version_number, 1);
        let v2 = remote.store(&q, 1).await.unwrap();
        assert_eq!(v2.version_number, 2);

        assert_eq!(remote.fetch(&q.id).await.unwrap().version_number, 2);
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let remote = InMemoryRemote::<Quotation>::new();
        let q = Quotation::new("Q-1", "Title", "Acme");
        remote.seed(q.clone(), 4);

        let err = remote.store(&q, 3).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionMismatch { actual: 4, .. }));

        // A write tagged past the server's version is accepted
        assert_eq!(remote.store(&q, 5).await.unwrap().version_number, 5);
    }

    #[tokio::test]
    async fn test_offline_and_failing() {
        let remote = InMemoryRemote::<Quotation>::new();
        remote.set_offline(true);
        assert!(remote.ping().await.unwrap_err().is_network_error());

        remote.set_offline(false);
        remote.set_failing(true);
        assert!(matches!(
            remote.fetch("x").await.unwrap_err(),
            SyncError::ServerStatus { status: 500, .. }
        ));

        remote.set_failing(false);
        assert!(matches!(remote.fetch("x").await.unwrap_err(), SyncError::NotFound { .. }));
    }
}
