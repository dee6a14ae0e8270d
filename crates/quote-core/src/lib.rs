//! # quote-core: Pure Types for Local-First Quotation Sync
//!
//! This crate holds every type and rule that the storage and sync layers
//! agree on. It performs no I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Quote Sync Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              UI processes (browser tabs, CLI, ...)              │   │
//! │  │        edit quotation ──► save ──► pull / push ──► render       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    quote-sync (Level 2)                         │   │
//! │  │   SyncSession, SyncCoordinator, BroadcastBus, AutoSave, ...    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    quote-store (Level 1)                        │   │
//! │  │           PersistentStore, EntityCache<T>, backends             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ quote-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ document  │  │ conflict  │  │   clock   │  │   │
//! │  │   │ Metadata  │  │ Quotation │  │  fields   │  │  System   │  │   │
//! │  │   │ Events    │  │ Snapshots │  │  detect   │  │  Manual   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO STORAGE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Cache metadata, sync status, broadcast events, conflicts
//! - [`document`] - The [`SyncDocument`] trait and the quotation documents
//! - [`conflict`] - Version conflict and conflicting-field detection
//! - [`clock`] - Injectable wall clock
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation rules
//!
//! ## Example Usage
//!
//! ```rust
//! use quote_core::{CacheMetadata, SyncStatus};
//! use chrono::Utc;
//!
//! let meta = CacheMetadata::dirty(Utc::now(), None);
//! assert!(meta.is_dirty);
//! assert_eq!(meta.sync_status, SyncStatus::Pending);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod conflict;
pub mod document;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{conflicting_fields, detect_conflict};
pub use document::{LineItem, Quotation, QuotationSnapshot, QuotationStatus, SnapshotList, SyncDocument};
pub use error::{CoreError, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default namespace prefixed to every persisted key.
///
/// Several applications may share one physical store; the namespace keeps
/// their keys apart.
pub const DEFAULT_NAMESPACE: &str = "quote";

/// Maximum length of an entity id.
pub const MAX_ENTITY_ID_LEN: usize = 128;
