//! # Sync Coordinator
//!
//! Moves documents between the entity cache and the server of record and
//! arbitrates version conflicts.
//!
//! ## Push State Machine (per entity)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  synced ──save_dirty──► pending ──push──► syncing                       │
//! │    ▲                      ▲  │              │                           │
//! │    │                      │  │ offline      ├─ server.v == known ──┐    │
//! │    │                      │  ▼              │                      │    │
//! │    │                      │ offline         ├─ network failure ► error  │
//! │    │                      │                 │                      │    │
//! │    │   edit during push   │                 └─ server.v > known    │    │
//! │    │   (stamp version,    │                          │             │    │
//! │    │    stay dirty) ──────┘                          ▼             │    │
//! │    │                                             conflict          │    │
//! │    │                                                 │ resolver    │    │
//! │    │            keep-server (adopt server copy)      │             │    │
//! │    ├─────────────────────────────────────────────────┤             │    │
//! │    │            keep-local / merge (PUT v+1)         │             │    │
//! │    ├─────────────────────────────────────────────────┘             │    │
//! │    │            PUT with expected version                          │    │
//! │    └───────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  cancel leaves the entity in `conflict` for a later retry.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - A push never sends a write while the server holds a version newer
//!   than the one the local copy was based on, unless a resolver chose
//!   `keep-local`/`merge` for that exact conflict.
//! - A pull never overwrites dirty local data.
//! - Failures are values ([`PullOutcome`], [`PushOutcome`]) and a
//!   `lastError` on the entity; nothing here returns an error.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use quote_core::{
    detect_conflict, BroadcastEventKind, CachedDocument, Clock, ConflictInfo, ResolutionStrategy,
    ServerDocument, SyncDocument, SyncStatus, ValidationError,
};
use quote_store::EntityCache;

use crate::bus::BroadcastBus;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::remote::RemoteDocuments;

/// Default age after which a persisted `syncing` status is considered
/// abandoned by the process that set it.
pub const DEFAULT_PUSH_IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Conflict Resolution
// =============================================================================

/// Chooses how to settle a version conflict.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &ConflictInfo) -> ResolutionStrategy;
}

/// A fixed strategy resolves every conflict the same way.
#[async_trait]
impl ConflictResolver for ResolutionStrategy {
    async fn resolve(&self, _conflict: &ConflictInfo) -> ResolutionStrategy {
        *self
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome<T> {
    /// The server copy was written to the cache.
    Updated(ServerDocument<T>),
    /// Local edits are pending; the cache was left as is.
    LocalChangesPending(T),
    /// No request was made; the cached copy, if any.
    Offline(Option<T>),
    /// The server has no such document; the cached copy, if any.
    NotFound(Option<T>),
    /// The request failed; the cached copy, if any.
    Failed { cached: Option<T>, error: String },
}

impl<T> PullOutcome<T> {
    /// The document the caller should show after the pull.
    pub fn data(&self) -> Option<&T> {
        match self {
            PullOutcome::Updated(server) => Some(&server.data),
            PullOutcome::LocalChangesPending(doc) => Some(doc),
            PullOutcome::Offline(cached)
            | PullOutcome::NotFound(cached)
            | PullOutcome::Failed { cached, .. } => cached.as_ref(),
        }
    }
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Nothing to push: not cached or not dirty.
    Clean,
    /// The local copy is on the server at `version`.
    Pushed { version: i64 },
    /// No request was made; the entity is marked `offline`.
    Offline,
    /// Another push of this entity is in flight.
    InFlight,
    /// A conflict was found and no resolver was supplied.
    Conflict(ConflictInfo),
    /// The resolver settled the conflict; the entity is at `version`.
    Resolved {
        strategy: ResolutionStrategy,
        version: i64,
    },
    /// The resolver chose `cancel`; the entity stays in `conflict`.
    Cancelled(ConflictInfo),
    /// The push failed; the entity is in `error`.
    Failed(String),
}

impl PushOutcome {
    /// True when the entity is no longer waiting on this push.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PushOutcome::Clean | PushOutcome::Pushed { .. } | PushOutcome::Resolved { .. }
        )
    }

    /// True when the push stopped at a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PushOutcome::Conflict(_) | PushOutcome::Cancelled(_))
    }
}

impl fmt::Display for PushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushOutcome::Clean => write!(f, "clean"),
            PushOutcome::Pushed { version } => write!(f, "pushed (v{})", version),
            PushOutcome::Offline => write!(f, "offline"),
            PushOutcome::InFlight => write!(f, "push already in flight"),
            PushOutcome::Conflict(info) => write!(
                f,
                "conflict (local v{}, server v{}; fields: {})",
                info.local_version,
                info.server_version,
                info.conflicting_fields.join(", ")
            ),
            PushOutcome::Resolved { strategy, version } => {
                write!(f, "resolved {} (v{})", strategy, version)
            }
            PushOutcome::Cancelled(_) => write!(f, "conflict left unresolved"),
            PushOutcome::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

/// Per-entity results of [`SyncCoordinator::sync_all_dirty`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub outcomes: BTreeMap<String, PushOutcome>,
}

impl SyncReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn conflicts(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_conflict()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, PushOutcome::Failed(_)))
            .count()
    }

    /// True if every entity ended clean or synced.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(PushOutcome::is_success)
    }
}

// =============================================================================
// In-flight Guard
// =============================================================================

struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Sync Coordinator
// =============================================================================

/// Pulls, pushes and resolves conflicts for one document type.
///
/// Clones share the in-flight set, so a clone handed to a background task
/// still allows only one push per entity.
pub struct SyncCoordinator<T: SyncDocument> {
    cache: EntityCache<T>,
    remote: Arc<dyn RemoteDocuments<T>>,
    connectivity: ConnectivityMonitor,
    bus: Option<BroadcastBus>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    push_timeout: Duration,
}

impl<T: SyncDocument> Clone for SyncCoordinator<T> {
    fn clone(&self) -> Self {
        SyncCoordinator {
            cache: self.cache.clone(),
            remote: self.remote.clone(),
            connectivity: self.connectivity.clone(),
            bus: self.bus.clone(),
            in_flight: self.in_flight.clone(),
            push_timeout: self.push_timeout,
        }
    }
}

impl<T: SyncDocument> fmt::Debug for SyncCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("remote", &self.remote)
            .field("online", &self.connectivity.is_online())
            .field("in_flight", &lock(&self.in_flight).len())
            .finish()
    }
}

impl<T: SyncDocument> SyncCoordinator<T> {
    pub fn new(
        cache: EntityCache<T>,
        remote: Arc<dyn RemoteDocuments<T>>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        SyncCoordinator {
            cache,
            remote,
            connectivity,
            bus: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            push_timeout: DEFAULT_PUSH_IN_FLIGHT_TIMEOUT,
        }
    }

    /// Announces sync outcomes on `bus`.
    pub fn with_bus(mut self, bus: BroadcastBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets how old a persisted `syncing` status must be before it is
    /// treated as abandoned.
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &EntityCache<T> {
        &self.cache
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Checks that the server is reachable.
    pub async fn ping(&self) -> bool {
        self.remote.ping().await.is_ok()
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Fetches the server copy and caches it unless local edits are pending.
    pub async fn pull(&self, id: &str) -> PullOutcome<T> {
        if !self.connectivity.is_online() {
            debug!(entity_id = %id, "Offline; pull skipped");
            return PullOutcome::Offline(self.cache.get(id).await);
        }

        let server = match self.remote.fetch(id).await {
            Ok(server) => server,
            Err(SyncError::NotFound { .. }) => {
                debug!(entity_id = %id, "Not on server");
                return PullOutcome::NotFound(self.cache.get(id).await);
            }
            Err(e) => {
                let error = e.to_string();
                warn!(entity_type = T::ENTITY_TYPE, entity_id = %id, error = %error, "Pull failed");
                self.cache.mark_sync_error(id, Some(error.clone())).await;
                return PullOutcome::Failed {
                    cached: self.cache.get(id).await,
                    error,
                };
            }
        };

        // Re-read after the await; an edit may have landed meanwhile
        if let Some(cached) = self.cache.get_with_meta(id).await {
            if cached.metadata.is_dirty {
                debug!(
                    entity_id = %id,
                    server_version = server.version_number,
                    known_version = cached.metadata.server_version,
                    "Local changes pending; pull left cache untouched"
                );
                return PullOutcome::LocalChangesPending(cached.data);
            }
        }

        if !self.cache.save_server_copy(&server).await {
            let error = format!("local cache write failed for {}", id);
            return PullOutcome::Failed {
                cached: self.cache.get(id).await,
                error,
            };
        }

        info!(
            entity_type = T::ENTITY_TYPE,
            entity_id = %id,
            version = server.version_number,
            "Pulled server copy"
        );
        PullOutcome::Updated(server)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Pushes the dirty local copy, consulting `resolver` on a conflict.
    pub async fn push(&self, id: &str, resolver: Option<&dyn ConflictResolver>) -> PushOutcome {
        let Some(cached) = self.cache.get_with_meta(id).await else {
            return PushOutcome::Clean;
        };
        if !cached.metadata.is_dirty {
            return PushOutcome::Clean;
        }

        if !self.connectivity.is_online() {
            self.cache.mark_offline(id).await;
            debug!(entity_id = %id, "Offline; push deferred");
            return PushOutcome::Offline;
        }

        // Drafts are cached as typed; only a complete document goes out
        if let Err(e) = cached.data.validate() {
            return self.reject_invalid(id, e).await;
        }

        let Some(_guard) = self.begin_push(&cached) else {
            debug!(entity_id = %id, "Push already in flight");
            return PushOutcome::InFlight;
        };
        self.cache.mark_syncing(id).await;

        let server = match self.remote.fetch(id).await {
            Ok(server) => Some(server),
            Err(SyncError::NotFound { .. }) => None,
            Err(e) => return self.fail(id, e).await,
        };

        let conflict = server.as_ref().and_then(|s| detect_conflict(&cached, s));
        match (server, conflict) {
            (Some(server), Some(info)) => self.settle_conflict(id, cached, server, info, resolver).await,
            _ => {
                let expected = cached.metadata.server_version;
                match self.remote.store(&cached.data, expected).await {
                    Ok(stored) => {
                        self.finish_push(&cached, &stored).await;
                        self.announce(BroadcastEventKind::SyncCompleted, id, json!({ "version": stored.version_number }))
                            .await;
                        info!(
                            entity_type = T::ENTITY_TYPE,
                            entity_id = %id,
                            version = stored.version_number,
                            "Pushed local copy"
                        );
                        PushOutcome::Pushed {
                            version: stored.version_number,
                        }
                    }
                    Err(e) => self.fail(id, e).await,
                }
            }
        }
    }

    async fn settle_conflict(
        &self,
        id: &str,
        cached: CachedDocument<T>,
        server: ServerDocument<T>,
        info: ConflictInfo,
        resolver: Option<&dyn ConflictResolver>,
    ) -> PushOutcome {
        warn!(
            entity_type = T::ENTITY_TYPE,
            entity_id = %id,
            local_version = info.local_version,
            server_version = info.server_version,
            fields = ?info.conflicting_fields,
            "Version conflict"
        );
        self.cache.mark_conflict(id).await;
        self.announce(
            BroadcastEventKind::ConflictDetected,
            id,
            serde_json::to_value(&info).unwrap_or_default(),
        )
        .await;

        let Some(resolver) = resolver else {
            return PushOutcome::Conflict(info);
        };

        let strategy = resolver.resolve(&info).await;
        debug!(entity_id = %id, %strategy, "Conflict resolution chosen");

        let version = match strategy {
            ResolutionStrategy::Cancel => {
                info!(entity_id = %id, "Conflict resolution cancelled");
                return PushOutcome::Cancelled(info);
            }
            ResolutionStrategy::KeepServer => {
                let edited = self
                    .cache
                    .get(id)
                    .await
                    .is_some_and(|latest| latest != cached.data);
                if edited {
                    debug!(entity_id = %id, "Discarding local edits made while the conflict was open");
                }
                if !self.cache.save_server_copy(&server).await {
                    let error = format!("local cache write failed for {}", id);
                    self.cache.mark_sync_error(id, Some(error.clone())).await;
                    return PushOutcome::Failed(error);
                }
                server.version_number
            }
            ResolutionStrategy::KeepLocal | ResolutionStrategy::Merge => {
                if strategy == ResolutionStrategy::Merge {
                    warn!(entity_id = %id, "Field-level merge unsupported; keeping local copy");
                }
                // The resolver may have taken a while; push the newest local copy
                let latest = self.cache.get_with_meta(id).await.unwrap_or(cached);
                if let Err(e) = latest.data.validate() {
                    return self.reject_invalid(id, e).await;
                }
                match self.remote.store(&latest.data, server.version_number + 1).await {
                    Ok(stored) => {
                        self.finish_push(&latest, &stored).await;
                        stored.version_number
                    }
                    Err(e) => return self.fail(id, e).await,
                }
            }
        };

        self.announce(
            BroadcastEventKind::ConflictResolved,
            id,
            json!({ "strategy": strategy, "version": version }),
        )
        .await;
        info!(entity_id = %id, %strategy, version, "Conflict resolved");

        PushOutcome::Resolved { strategy, version }
    }

    /// Pushes every dirty entity independently.
    pub async fn sync_all_dirty(&self, resolver: Option<&dyn ConflictResolver>) -> SyncReport {
        let mut report = SyncReport::default();
        for id in self.cache.dirty_ids().await {
            let outcome = self.push(&id, resolver).await;
            report.outcomes.insert(id, outcome);
        }

        if !report.is_empty() {
            info!(
                total = report.len(),
                succeeded = report.succeeded(),
                conflicts = report.conflicts(),
                failed = report.failed(),
                "Synced dirty entities"
            );
        }
        report
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Claims the entity for one push, or `None` if a push is in flight
    /// here or, recently, in another process.
    fn begin_push(&self, cached: &CachedDocument<T>) -> Option<InFlight> {
        let id = cached.data.id().to_string();

        if cached.metadata.sync_status == SyncStatus::Syncing {
            let now = self.cache.store().clock().now();
            let fresh = cached.metadata.last_sync_attempt.is_some_and(|at| {
                chrono::Duration::from_std(self.push_timeout).is_ok_and(|limit| now - at < limit)
            });
            if fresh && !lock(&self.in_flight).contains(&id) {
                return None;
            }
            if !fresh {
                warn!(entity_id = %id, "Abandoned push found; retrying");
            }
        }

        if !lock(&self.in_flight).insert(id.clone()) {
            return None;
        }
        Some(InFlight {
            ids: self.in_flight.clone(),
            id,
        })
    }

    /// Records a successful write. An edit that landed during the push keeps
    /// the entity dirty with the new server version.
    async fn finish_push(&self, pushed: &CachedDocument<T>, stored: &ServerDocument<T>) {
        let id = pushed.data.id();
        let unchanged = self
            .cache
            .get_with_meta(id)
            .await
            .is_some_and(|now| now.metadata.cached_at == pushed.metadata.cached_at && now.data == pushed.data);

        if unchanged {
            self.cache
                .mark_synced(id, stored.updated_at, stored.version_number)
                .await;
        } else {
            debug!(entity_id = %id, "Edited during push; staying dirty");
            self.cache
                .stamp_server_version(id, stored.updated_at, stored.version_number)
                .await;
        }
    }

    async fn fail(&self, id: &str, error: SyncError) -> PushOutcome {
        let message = error.to_string();
        warn!(entity_type = T::ENTITY_TYPE, entity_id = %id, error = %message, "Push failed");
        self.cache.mark_sync_error(id, Some(message.clone())).await;
        PushOutcome::Failed(message)
    }

    async fn reject_invalid(&self, id: &str, error: ValidationError) -> PushOutcome {
        let error = SyncError::InvalidDocument {
            id: id.to_string(),
            reason: error.to_string(),
        };
        self.fail(id, error).await
    }

    async fn announce(&self, kind: BroadcastEventKind, id: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(bus.event(kind, id).with_payload(payload)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use quote_core::{LineItem, ManualClock, Quotation};
    use quote_store::PersistentStore;

    struct Fixture {
        coordinator: SyncCoordinator<Quotation>,
        cache: EntityCache<Quotation>,
        remote: InMemoryRemote<Quotation>,
        connectivity: ConnectivityMonitor,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = PersistentStore::in_memory().with_clock(Arc::new(clock.clone()));
        let cache = EntityCache::<Quotation>::new(store);
        let remote = InMemoryRemote::<Quotation>::with_clock(Arc::new(clock.clone()));
        let connectivity = ConnectivityMonitor::with_clock(true, Arc::new(clock.clone()));
        let coordinator = SyncCoordinator::new(cache.clone(), Arc::new(remote.clone()), connectivity.clone());
        Fixture {
            coordinator,
            cache,
            remote,
            connectivity,
            clock,
        }
    }

    fn quotation() -> Quotation {
        Quotation::new("Q-100", "Office fit-out", "Acme")
    }

    #[tokio::test]
    async fn test_pull_writes_clean_copy() {
        let f = fixture();
        let q = quotation();
        f.remote.seed(q.clone(), 3);

        let outcome = f.coordinator.pull(&q.id).await;
        assert!(matches!(outcome, PullOutcome::Updated(ref s) if s.version_number == 3));

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, q);
        assert!(!cached.metadata.is_dirty);
        assert_eq!(cached.metadata.server_version, 3);
        assert_eq!(cached.metadata.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_pull_never_overwrites_dirty() {
        let f = fixture();
        let q = quotation();
        let mut server_copy = q.clone();
        server_copy.title = "Server title".into();
        f.remote.seed(server_copy, 5);

        let mut local = q.clone();
        local.title = "Local title".into();
        assert!(f.cache.save_dirty(&local).await);

        let outcome = f.coordinator.pull(&q.id).await;
        assert_eq!(outcome, PullOutcome::LocalChangesPending(local.clone()));

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, local);
        assert!(cached.metadata.is_dirty);
        assert_eq!(cached.metadata.server_version, 0);
    }

    #[tokio::test]
    async fn test_pull_offline_is_noop() {
        let f = fixture();
        let q = quotation();
        f.remote.seed(q.clone(), 1);
        f.cache.save_dirty(&q).await;
        f.connectivity.set_online(false);

        let outcome = f.coordinator.pull(&q.id).await;
        assert_eq!(outcome, PullOutcome::Offline(Some(q.clone())));
        assert_eq!(f.remote.fetch_count(), 0);
        assert_eq!(f.cache.get_sync_status(&q.id).await, Some(SyncStatus::Pending));
    }

    #[tokio::test]
    async fn test_pull_failure_records_error() {
        let f = fixture();
        let q = quotation();
        f.cache.save_dirty(&q).await;
        f.remote.set_failing(true);

        let outcome = f.coordinator.pull(&q.id).await;
        assert!(matches!(outcome, PullOutcome::Failed { .. }));

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, q);
        assert_eq!(cached.metadata.sync_status, SyncStatus::Error);
        assert!(cached.metadata.last_error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_push_clean_is_noop() {
        let f = fixture();
        let q = quotation();
        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::Clean);

        f.cache.save(&q).await;
        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::Clean);
        assert_eq!(f.remote.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_push_new_document() {
        let f = fixture();
        let q = quotation();
        f.cache.save_dirty(&q).await;

        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::Pushed { version: 1 });

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert!(!cached.metadata.is_dirty);
        assert_eq!(cached.metadata.server_version, 1);
        assert_eq!(f.remote.document(&q.id).unwrap().data, q);
    }

    #[tokio::test]
    async fn test_push_offline_marks_offline() {
        let f = fixture();
        let q = quotation();
        f.cache.save_dirty(&q).await;
        f.connectivity.set_online(false);

        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::Offline);
        assert_eq!(f.cache.get_sync_status(&q.id).await, Some(SyncStatus::Offline));
        assert!(f.cache.is_dirty(&q.id).await);
        assert_eq!(f.remote.store_count(), 0);
    }

    #[tokio::test]
    async fn test_push_holds_back_unfinished_draft() {
        let f = fixture();
        let mut q = quotation();
        q.line_items.push(LineItem::new("new row", 0, 0));
        assert!(f.cache.save_dirty(&q).await);

        let outcome = f.coordinator.push(&q.id, None).await;
        assert!(matches!(outcome, PushOutcome::Failed(ref e) if e.contains("not ready to push")));
        assert_eq!(f.remote.fetch_count(), 0);
        assert_eq!(f.remote.store_count(), 0);

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, q);
        assert!(cached.metadata.is_dirty);
        assert_eq!(cached.metadata.sync_status, SyncStatus::Error);

        // Once the row is filled in the draft goes out
        q.line_items[0].quantity = 2;
        q.line_items[0].unit_price_cents = 4500;
        f.cache.save_dirty(&q).await;
        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::Pushed { version: 1 });
    }

    #[tokio::test]
    async fn test_push_conflict_without_resolver_sends_nothing() {
        let f = fixture();
        let q = quotation();
        let seeded = f.remote.seed(q.clone(), 3);
        f.cache.save_server_copy(&seeded).await;

        let mut local = q.clone();
        local.notes = Some("local note".into());
        f.cache.save_dirty(&local).await;

        let mut theirs = q.clone();
        theirs.title = "Theirs".into();
        f.remote.seed(theirs, 4);
        let stores_before = f.remote.store_count();

        match f.coordinator.push(&q.id, None).await {
            PushOutcome::Conflict(info) => {
                assert_eq!(info.local_version, 3);
                assert_eq!(info.server_version, 4);
                assert!(info.conflicting_fields.contains(&"title".to_string()));
                assert!(info.conflicting_fields.contains(&"notes".to_string()));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(f.remote.store_count(), stores_before);
        assert_eq!(f.cache.get_sync_status(&q.id).await, Some(SyncStatus::Conflict));
        assert_eq!(f.cache.get(&q.id).await.unwrap(), local);
    }

    #[tokio::test]
    async fn test_keep_local_bumps_past_server() {
        let f = fixture();
        let q = quotation();
        f.cache.save_server_copy(&f.remote.seed(q.clone(), 3)).await;
        let mut local = q.clone();
        local.title = "Mine".into();
        f.cache.save_dirty(&local).await;
        f.remote.seed(q.clone(), 4);

        let outcome = f
            .coordinator
            .push(&q.id, Some(&ResolutionStrategy::KeepLocal))
            .await;
        assert_eq!(
            outcome,
            PushOutcome::Resolved {
                strategy: ResolutionStrategy::KeepLocal,
                version: 5
            }
        );
        assert_eq!(f.remote.document(&q.id).unwrap().data, local);
        let meta = f.cache.get_with_meta(&q.id).await.unwrap().metadata;
        assert!(!meta.is_dirty);
        assert_eq!(meta.server_version, 5);
    }

    #[tokio::test]
    async fn test_merge_behaves_like_keep_local() {
        let f = fixture();
        let q = quotation();
        f.cache.save_server_copy(&f.remote.seed(q.clone(), 1)).await;
        let mut local = q.clone();
        local.title = "Mine".into();
        f.cache.save_dirty(&local).await;
        f.remote.seed(q.clone(), 2);

        let outcome = f.coordinator.push(&q.id, Some(&ResolutionStrategy::Merge)).await;
        assert!(matches!(outcome, PushOutcome::Resolved { strategy: ResolutionStrategy::Merge, version: 3 }));
        assert_eq!(f.remote.document(&q.id).unwrap().data, local);
    }

    #[tokio::test]
    async fn test_keep_server_adopts_server_copy() {
        let f = fixture();
        let q = quotation();
        f.cache.save_server_copy(&f.remote.seed(q.clone(), 3)).await;
        let mut local = q.clone();
        local.title = "Mine".into();
        f.cache.save_dirty(&local).await;
        let mut theirs = q.clone();
        theirs.title = "Theirs".into();
        f.remote.seed(theirs.clone(), 4);

        let outcome = f
            .coordinator
            .push(&q.id, Some(&ResolutionStrategy::KeepServer))
            .await;
        assert!(matches!(outcome, PushOutcome::Resolved { version: 4, .. }));

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, theirs);
        assert!(!cached.metadata.is_dirty);
        assert_eq!(cached.metadata.server_version, 4);
        assert_eq!(f.remote.document(&q.id).unwrap().version_number, 4);
    }

    /// Edits the cache while deciding, like a user typing during a dialog.
    struct EditWhileResolving {
        cache: EntityCache<Quotation>,
        edit: Quotation,
    }

    #[async_trait]
    impl ConflictResolver for EditWhileResolving {
        async fn resolve(&self, _conflict: &ConflictInfo) -> ResolutionStrategy {
            self.cache.save_dirty(&self.edit).await;
            ResolutionStrategy::KeepServer
        }
    }

    #[tokio::test]
    async fn test_keep_server_replaces_edits_made_while_resolving() {
        let f = fixture();
        let q = quotation();
        f.cache.save_server_copy(&f.remote.seed(q.clone(), 3)).await;
        let mut local = q.clone();
        local.title = "Mine".into();
        f.cache.save_dirty(&local).await;
        let mut theirs = q.clone();
        theirs.title = "Theirs".into();
        f.remote.seed(theirs.clone(), 4);

        let mut typed = local.clone();
        typed.notes = Some("typed during the dialog".into());
        let resolver = EditWhileResolving {
            cache: f.cache.clone(),
            edit: typed,
        };

        let outcome = f.coordinator.push(&q.id, Some(&resolver)).await;
        assert!(matches!(outcome, PushOutcome::Resolved { strategy: ResolutionStrategy::KeepServer, version: 4 }));

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, theirs);
        assert!(!cached.metadata.is_dirty);
        assert_eq!(f.remote.store_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_conflict() {
        let f = fixture();
        let q = quotation();
        f.cache.save_server_copy(&f.remote.seed(q.clone(), 3)).await;
        let mut local = q.clone();
        local.title = "Mine".into();
        f.cache.save_dirty(&local).await;
        f.remote.seed(q.clone(), 4);
        let stores_before = f.remote.store_count();

        let outcome = f.coordinator.push(&q.id, Some(&ResolutionStrategy::Cancel)).await;
        assert!(matches!(outcome, PushOutcome::Cancelled(_)));
        assert_eq!(f.remote.store_count(), stores_before);

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.metadata.sync_status, SyncStatus::Conflict);
        assert!(cached.metadata.is_dirty);
        assert_eq!(cached.data, local);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_data() {
        let f = fixture();
        let q = quotation();
        f.cache.save_dirty(&q).await;
        f.remote.set_offline(true);

        let outcome = f.coordinator.push(&q.id, None).await;
        assert!(matches!(outcome, PushOutcome::Failed(_)));

        let cached = f.cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data, q);
        assert!(cached.metadata.is_dirty);
        assert_eq!(cached.metadata.sync_status, SyncStatus::Error);
        assert!(cached.metadata.last_error.is_some());

        // The in-flight claim was released
        f.remote.set_offline(false);
        assert!(f.coordinator.push(&q.id, None).await.is_success());
    }

    #[tokio::test]
    async fn test_fresh_syncing_status_blocks_push() {
        let f = fixture();
        let q = quotation();
        f.cache.save_dirty(&q).await;
        // Another process claimed the push just now
        f.cache.mark_syncing(&q.id).await;

        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::InFlight);

        f.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(f.coordinator.push(&q.id, None).await, PushOutcome::Pushed { version: 1 });
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let f = fixture();
        let a = Quotation::new("Q-1", "A", "Acme");
        let b = Quotation::new("Q-2", "B", "Acme");
        let c = Quotation::new("Q-3", "C", "Acme");

        // b conflicts: cached at v1, server at v2
        f.cache.save_server_copy(&f.remote.seed(b.clone(), 1)).await;
        f.remote.seed(b.clone(), 2);

        for q in [&a, &b, &c] {
            f.cache.save_dirty(q).await;
        }

        let report = f.coordinator.sync_all_dirty(None).await;
        assert_eq!(report.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.conflicts(), 1);
        assert!(report.outcomes[&b.id].is_conflict());
        assert!(!f.cache.is_dirty(&a.id).await);
        assert!(!f.cache.is_dirty(&c.id).await);
        assert!(f.cache.is_dirty(&b.id).await);
    }
}
