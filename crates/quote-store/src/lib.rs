//! # quote-store: Local Storage for Quote Sync
//!
//! The persistent key/value store and the dirty-tracking entity cache.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Quote Sync Data Flow                             │
//! │                                                                         │
//! │  SyncCoordinator / AutoSaver (quote-sync)                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   quote-store (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │ EntityCache<T>│───►│PersistentStore│───►│   Backend    │  │   │
//! │  │   │  (cache.rs)   │    │  (store.rs)   │    │ (backend/)   │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ save          │    │ namespace     │    │ Memory       │  │   │
//! │  │   │ save_dirty    │    │ TTL envelope  │    │ SQLite (WAL) │  │   │
//! │  │   │ mark_*        │    │ quota retry   │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`backend`] - Raw key/value backends
//! - [`store`] - Namespaced store with TTL and quota recovery
//! - [`cache`] - Entity cache over the store
//! - [`migrations`] - Embedded SQLite migrations
//! - [`error`] - Backend error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quote_store::{EntityCache, PersistentStore, SqliteBackend, SqliteConfig};
//! use quote_core::Quotation;
//!
//! let backend = SqliteBackend::connect(SqliteConfig::new("quote-cache.db")).await?;
//! let store = PersistentStore::new(Arc::new(backend), "quote");
//! let cache: EntityCache<Quotation> = EntityCache::new(store);
//!
//! cache.save_dirty(&quotation).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backend;
pub mod cache;
pub mod error;
pub mod migrations;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{MemoryBackend, SqliteBackend, SqliteConfig, StorageBackend};
pub use cache::EntityCache;
pub use error::{StoreError, StoreResult};
pub use store::PersistentStore;
