//! # Remote Documents
//!
//! The server of record, seen from one process.
//!
//! ## Server Contract
//! ```text
//! GET  {base}/{entity_type}/{id}
//!      200 → { ...document fields, "updatedAt": ISO8601, "versionNumber": n }
//!      404 → NotFound
//!
//! PUT  {base}/{entity_type}/{id}
//!      If-Match: "<expected version>"
//!      body: { ...document fields, "versionNumber": <expected version> }
//!      200 → echoes the persisted document with its new updatedAt/versionNumber
//!      409 / 412 → VersionMismatch (server moved past the expected version)
//! ```
//!
//! ## Versioning Rule
//! The server is the only arbiter of which version is current. A write
//! based on version `e` is accepted when `e >= current`, and the stored
//! document becomes `current + 1`. Versions never decrease.
//!
//! ## Implementations
//! - [`HttpRemote`] - reqwest client for a real server
//! - [`InMemoryRemote`] - server of record held in memory (tests, demos)
//! - [`server::document_router`] - axum routes serving an [`InMemoryRemote`]

use std::fmt;

use async_trait::async_trait;

use quote_core::{ServerDocument, SyncDocument};

use crate::error::SyncResult;

pub mod http;
pub mod memory;
pub mod server;

pub use http::HttpRemote;
pub use memory::InMemoryRemote;
pub use server::{document_router, DocumentServer, DocumentServerHandle};

/// Access to the server copies of one document type.
#[async_trait]
pub trait RemoteDocuments<T: SyncDocument>: Send + Sync + fmt::Debug {
    /// Fetches the current server copy.
    async fn fetch(&self, id: &str) -> SyncResult<ServerDocument<T>>;

    /// Writes `doc` based on `expected_version`; returns the persisted copy.
    async fn store(&self, doc: &T, expected_version: i64) -> SyncResult<ServerDocument<T>>;

    /// Checks that the server is reachable.
    async fn ping(&self) -> SyncResult<()>;
}
