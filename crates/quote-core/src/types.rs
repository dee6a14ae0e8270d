//! # Sync Types
//!
//! Types shared by the store, the coordinator and the broadcast bus.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Sync Types                                    │
//! │                                                                         │
//! │  ┌─────────────────────┐        ┌─────────────────────────────────┐    │
//! │  │  CachedDocument<T>  │        │        CacheMetadata            │    │
//! │  │  ─────────────────  │ owns   │  ─────────────────────────────  │    │
//! │  │  data: T            │──────► │  cachedAt, serverUpdatedAt      │    │
//! │  │  metadata           │        │  serverVersion, isDirty         │    │
//! │  └─────────────────────┘        │  lastSyncAttempt, syncStatus    │    │
//! │                                 │  lastError                      │    │
//! │                                 └─────────────────────────────────┘    │
//! │                                                                         │
//! │  ┌─────────────────────┐   ┌─────────────────┐   ┌─────────────────┐   │
//! │  │ ServerDocument<T>   │   │  ConflictInfo   │   │ BroadcastEvent  │   │
//! │  │  (GET / PUT body)   │   │  (transient)    │   │  (ephemeral)    │   │
//! │  └─────────────────────┘   └─────────────────┘   └─────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dirty Invariant
//! `is_dirty == true` whenever `sync_status` is `pending`, `error` or
//! `conflict`. `is_dirty == false` only right after a successful pull or
//! push. Every constructor and transition in this module preserves it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Sync Status
// =============================================================================

/// Per-entity sync state.
///
/// ## State Machine
/// ```text
///            saveDirty                 push start
///  synced ─────────────► pending ─────────────────► syncing
///    ▲                     ▲  │                       │  │
///    │  push ok / pull ok  │  │ offline               │  │ network fault
///    └─────────────────────┼──┼───────────────────────┘  ▼
///                          │  ▼                        error
///                          │ offline                     │
///                          │                             │ retry
///                          └──── conflict ◄──────────────┘
///                                (server moved ahead)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local data equals the last known server data.
    #[default]
    Synced,
    /// Local edits waiting to be pushed.
    Pending,
    /// A push is in flight.
    Syncing,
    /// The server moved past the version this copy was based on.
    Conflict,
    /// The last pull or push failed.
    Error,
    /// Local edits exist but the process is offline.
    Offline,
}

impl SyncStatus {
    /// Returns true if this status can only be held by a dirty entry.
    pub fn requires_dirty(&self) -> bool {
        matches!(
            self,
            SyncStatus::Pending | SyncStatus::Error | SyncStatus::Conflict
        )
    }

    /// Returns the wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "conflict" => Ok(SyncStatus::Conflict),
            "error" => Ok(SyncStatus::Error),
            "offline" => Ok(SyncStatus::Offline),
            other => Err(format!("Unknown sync status: '{}'", other)),
        }
    }
}

// =============================================================================
// Cache Metadata
// =============================================================================

/// Sync bookkeeping stored next to every cached document.
///
/// Serialized in camelCase so the persisted record matches the shape the
/// browser UI reads:
/// ```json
/// { "cachedAt": "...", "serverUpdatedAt": "...", "serverVersion": 3,
///   "isDirty": true, "lastSyncAttempt": null, "syncStatus": "pending" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Local write time.
    #[ts(as = "String")]
    pub cached_at: DateTime<Utc>,

    /// Server timestamp of the last version known to exist on the server.
    /// `None` until the entity has been pulled or pushed once.
    #[ts(as = "Option<String>")]
    pub server_updated_at: Option<DateTime<Utc>>,

    /// Last version known to exist on the server (0 = never seen).
    pub server_version: i64,

    /// Local data diverges from the last server-synced snapshot.
    pub is_dirty: bool,

    /// When the last push was started.
    #[ts(as = "Option<String>")]
    pub last_sync_attempt: Option<DateTime<Utc>>,

    /// Current sync state.
    pub sync_status: SyncStatus,

    /// Message of the last failed pull/push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CacheMetadata {
    /// Metadata for a clean write, keeping the server fields of `previous`.
    pub fn clean(now: DateTime<Utc>, previous: Option<&CacheMetadata>) -> Self {
        CacheMetadata {
            cached_at: now,
            server_updated_at: previous.and_then(|p| p.server_updated_at),
            server_version: previous.map(|p| p.server_version).unwrap_or(0),
            is_dirty: false,
            last_sync_attempt: previous.and_then(|p| p.last_sync_attempt),
            sync_status: SyncStatus::Synced,
            last_error: None,
        }
    }

    /// Metadata for a dirty write, keeping the server fields of `previous`.
    pub fn dirty(now: DateTime<Utc>, previous: Option<&CacheMetadata>) -> Self {
        CacheMetadata {
            cached_at: now,
            server_updated_at: previous.and_then(|p| p.server_updated_at),
            server_version: previous.map(|p| p.server_version).unwrap_or(0),
            is_dirty: true,
            last_sync_attempt: previous.and_then(|p| p.last_sync_attempt),
            sync_status: SyncStatus::Pending,
            last_error: previous.and_then(|p| p.last_error.clone()),
        }
    }

    /// Clears dirty and stamps the server fields.
    ///
    /// Touches no clock-derived field, so applying it twice with the same
    /// arguments yields the same metadata as applying it once.
    pub fn mark_synced(&mut self, server_updated_at: DateTime<Utc>, server_version: i64) {
        self.server_updated_at = Some(server_updated_at);
        self.server_version = server_version;
        self.is_dirty = false;
        self.sync_status = SyncStatus::Synced;
        self.last_error = None;
    }

    /// Records a server version without clearing dirty.
    pub fn stamp_server_version(&mut self, server_updated_at: DateTime<Utc>, server_version: i64) {
        self.server_updated_at = Some(server_updated_at);
        self.server_version = server_version;
    }

    /// Records a failed pull/push.
    ///
    /// Only a dirty entry moves to `error`; a clean entry keeps `synced`
    /// and just retains the message.
    pub fn mark_error(&mut self, reason: Option<String>) {
        if self.is_dirty {
            self.sync_status = SyncStatus::Error;
        }
        self.last_error = reason.or_else(|| Some("sync failed".to_string()));
    }

    /// Moves the entry to `conflict`, which implies dirty.
    pub fn mark_conflict(&mut self) {
        self.is_dirty = true;
        self.sync_status = SyncStatus::Conflict;
    }

    /// Marks a push as in flight.
    pub fn mark_syncing(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Syncing;
        self.last_sync_attempt = Some(now);
    }

    /// Marks a dirty entry as waiting for connectivity.
    pub fn mark_offline(&mut self) {
        if self.is_dirty {
            self.sync_status = SyncStatus::Offline;
        }
    }

    /// Returns true if the dirty invariant holds.
    pub fn is_consistent(&self) -> bool {
        !self.sync_status.requires_dirty() || self.is_dirty
    }
}

// =============================================================================
// Cached Document
// =============================================================================

/// A full document snapshot plus its sync metadata.
///
/// `data` is replaced wholesale on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

// =============================================================================
// Server Document
// =============================================================================

/// The server's view of a document: the document fields plus
/// `updatedAt` and `versionNumber`, flattened into one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDocument<T> {
    #[serde(flatten)]
    pub data: T,

    pub updated_at: DateTime<Utc>,

    pub version_number: i64,
}

// =============================================================================
// Conflict Info
// =============================================================================

/// Describes a version conflict found at push time.
///
/// Created by the coordinator, handed to the resolver, then discarded.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    /// Entity the conflict belongs to.
    pub entity_id: String,

    /// Server version the local copy was based on.
    pub local_version: i64,

    /// Version currently on the server.
    pub server_version: i64,

    /// Local write time.
    #[ts(as = "String")]
    pub local_updated_at: DateTime<Utc>,

    /// Server write time.
    #[ts(as = "String")]
    pub server_updated_at: DateTime<Utc>,

    /// Top-level fields whose values differ between the two copies.
    pub conflicting_fields: Vec<String>,
}

// =============================================================================
// Resolution Strategy
// =============================================================================

/// What to do about a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Re-push local data tagged past the server's version.
    KeepLocal,
    /// Discard local edits and adopt the server document.
    KeepServer,
    /// Accepted for compatibility; resolved exactly like `KeepLocal`.
    Merge,
    /// Leave the conflict in place; no further I/O.
    Cancel,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::KeepLocal => write!(f, "keep-local"),
            ResolutionStrategy::KeepServer => write!(f, "keep-server"),
            ResolutionStrategy::Merge => write!(f, "merge"),
            ResolutionStrategy::Cancel => write!(f, "cancel"),
        }
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "keep-local" | "local" => Ok(ResolutionStrategy::KeepLocal),
            "keep-server" | "server" => Ok(ResolutionStrategy::KeepServer),
            "merge" => Ok(ResolutionStrategy::Merge),
            "cancel" => Ok(ResolutionStrategy::Cancel),
            other => Err(format!(
                "Unknown resolution strategy: '{}'. Valid options: keep-local, keep-server, merge, cancel",
                other
            )),
        }
    }
}

// =============================================================================
// Broadcast Events
// =============================================================================

/// Kinds of cross-process notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEventKind {
    /// A process wrote a new local version of the entity.
    EntityUpdated,
    /// A push or pull finished and the cache is clean.
    SyncCompleted,
    /// A push found the server ahead of the local copy.
    ConflictDetected,
    /// A conflict was resolved with some strategy.
    ConflictResolved,
    /// A process asks siblings to announce what they hold.
    RequestState,
}

impl std::fmt::Display for BroadcastEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastEventKind::EntityUpdated => write!(f, "entity_updated"),
            BroadcastEventKind::SyncCompleted => write!(f, "sync_completed"),
            BroadcastEventKind::ConflictDetected => write!(f, "conflict_detected"),
            BroadcastEventKind::ConflictResolved => write!(f, "conflict_resolved"),
            BroadcastEventKind::RequestState => write!(f, "request_state"),
        }
    }
}

/// A best-effort cross-process notification.
///
/// Wire shape:
/// ```json
/// { "type": "entity_updated", "entityId": "q-1", "timestamp": 1700000000000,
///   "originId": "2f1c...", "payload": { "version": 4 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub kind: BroadcastEventKind,

    pub entity_id: String,

    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,

    /// Id of the publishing process.
    pub origin_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "Record<string, unknown> | null")]
    pub payload: Option<serde_json::Value>,
}

impl BroadcastEvent {
    /// Creates an event without payload.
    pub fn new(
        kind: BroadcastEventKind,
        entity_id: impl Into<String>,
        origin_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        BroadcastEvent {
            kind,
            entity_id: entity_id.into(),
            timestamp,
            origin_id: origin_id.into(),
            payload: None,
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serializes the event for a text transport.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an event received from a text transport.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_dirty_preserves_server_fields() {
        let mut synced = CacheMetadata::clean(at(10), None);
        synced.mark_synced(at(5), 3);

        let dirty = CacheMetadata::dirty(at(20), Some(&synced));
        assert!(dirty.is_dirty);
        assert_eq!(dirty.sync_status, SyncStatus::Pending);
        assert_eq!(dirty.server_version, 3);
        assert_eq!(dirty.server_updated_at, Some(at(5)));
        assert_eq!(dirty.cached_at, at(20));
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let mut once = CacheMetadata::dirty(at(1), None);
        once.mark_synced(at(2), 7);

        let mut twice = once.clone();
        twice.mark_synced(at(2), 7);

        assert_eq!(once, twice);
        assert!(!twice.is_dirty);
        assert_eq!(twice.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_error_on_clean_entry_keeps_synced() {
        let mut meta = CacheMetadata::clean(at(1), None);
        meta.mark_error(Some("timeout".into()));
        assert_eq!(meta.sync_status, SyncStatus::Synced);
        assert_eq!(meta.last_error.as_deref(), Some("timeout"));
        assert!(meta.is_consistent());

        let mut dirty = CacheMetadata::dirty(at(1), None);
        dirty.mark_error(None);
        assert_eq!(dirty.sync_status, SyncStatus::Error);
        assert!(dirty.last_error.is_some());
        assert!(dirty.is_consistent());
    }

    #[test]
    fn test_conflict_implies_dirty() {
        let mut meta = CacheMetadata::clean(at(1), None);
        meta.mark_conflict();
        assert!(meta.is_dirty);
        assert!(meta.is_consistent());
    }

    #[test]
    fn test_metadata_wire_shape() {
        let meta = CacheMetadata::dirty(at(0), None);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["isDirty"], true);
        assert_eq!(json["syncStatus"], "pending");
        assert_eq!(json["serverVersion"], 0);
        assert!(json["lastSyncAttempt"].is_null());
        assert!(json.get("lastError").is_none());
    }

    #[test]
    fn test_broadcast_event_wire_shape() {
        let event = BroadcastEvent::new(BroadcastEventKind::SyncCompleted, "q-1", "origin-a", 42)
            .with_payload(serde_json::json!({ "version": 4 }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync_completed");
        assert_eq!(json["entityId"], "q-1");
        assert_eq!(json["originId"], "origin-a");
        assert_eq!(json["payload"]["version"], 4);

        let parsed = BroadcastEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("keep-local".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::KeepLocal);
        assert_eq!("keep_server".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::KeepServer);
        assert_eq!("merge".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::Merge);
        assert!("overwrite".parse::<ResolutionStrategy>().is_err());
        assert_eq!(ResolutionStrategy::KeepServer.to_string(), "keep-server");
    }

    #[test]
    fn test_requires_dirty() {
        assert!(SyncStatus::Pending.requires_dirty());
        assert!(SyncStatus::Error.requires_dirty());
        assert!(SyncStatus::Conflict.requires_dirty());
        assert!(!SyncStatus::Synced.requires_dirty());
        assert!(!SyncStatus::Syncing.requires_dirty());
    }
}
