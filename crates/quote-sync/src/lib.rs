//! # quote-sync: Sync Engine for Quote Documents
//!
//! This crate keeps quotation documents consistent between the local cache,
//! sibling processes editing the same documents, and the server of record.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Session Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncSession (Main Orchestrator)                 │  │
//! │  │                                                                  │  │
//! │  │  One per process; explicit start() / shutdown()                 │  │
//! │  │  Forwards UI triggers (hidden, teardown, save now)               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  AutoSaver     │  │ SyncCoordinator│  │  BroadcastBus          │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Interval +     │  │ pull / push    │  │ LocalChannel or        │    │
//! │  │ debounce into  │  │ version check  │  │ WebSocket relay;       │    │
//! │  │ the cache      │  │ conflicts      │  │ own events filtered    │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          ▼                   ▼                                          │
//! │  ┌────────────────┐  ┌────────────────────────────────────────────┐    │
//! │  │  EntityCache   │  │  RemoteDocuments                           │    │
//! │  │  (quote-store) │  │  HttpRemote ──► DocumentServer / backend   │    │
//! │  │                │  │  InMemoryRemote (tests, local server)      │    │
//! │  └────────────────┘  └────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  BROADCAST EVENTS (between processes):                                 │
//! │  • entity_updated      - a local save landed in the shared cache      │
//! │  • sync_completed      - a push reached the server                    │
//! │  • conflict_detected   - a push found a newer server version          │
//! │  • conflict_resolved   - a conflict was settled                       │
//! │  • request_state       - ask siblings to re-announce unsynced work     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`session`] - `SyncSession` orchestrator and its builder
//! - [`coordinator`] - Pull, push and conflict resolution
//! - [`autosave`] - Interval and debounced saves into the cache
//! - [`bus`] - Cross-process broadcast bus and its transports
//! - [`remote`] - Server of record: HTTP client, in-memory store, HTTP server
//! - [`connectivity`] - Online/offline tracking
//! - [`config`] - Sync configuration (TOML + environment)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quote_sync::{SyncConfig, SyncSession};
//! use quote_store::{EntityCache, PersistentStore};
//!
//! let config = SyncConfig::load_or_default(None);
//!
//! let mut session = SyncSession::builder(config)
//!     .with_cache(EntityCache::new(store))
//!     .with_editor(quotation)
//!     .build()?;
//! session.start().await?;
//!
//! let editor = session.editor().expect("editor was configured");
//! editor.send_modify(|q| q.title = "Kitchen remodel".into());
//! let outcome = session.save_now().await;
//! println!("Pushed: {}", outcome);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod autosave;
pub mod bus;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod remote;
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use autosave::{AutoSaveHandle, AutoSaveScheduler, AutoSaveTiming, AutoSaver, FlushReason, SaveOutcome};
pub use bus::{BroadcastBus, BusTransport, LocalChannel, RelayConfig, RelayServer, RelayServerHandle, RelayTransport, Subscription};
pub use config::{BusSettings, SessionSettings, StorageSettings, SyncConfig, SyncSettings};
pub use connectivity::{ConnectivityMonitor, ConnectivitySnapshot};
pub use coordinator::{ConflictResolver, PullOutcome, PushOutcome, SyncCoordinator, SyncReport};
pub use error::{SyncError, SyncResult};
pub use remote::{DocumentServer, DocumentServerHandle, HttpRemote, InMemoryRemote, RemoteDocuments};
pub use session::{NoOpEmitter, SessionStatus, SyncEventEmitter, SyncSession, SyncSessionBuilder};

pub use bus::relay::ConnectionState;
