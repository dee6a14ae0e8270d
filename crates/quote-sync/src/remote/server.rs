//! # Document Server
//!
//! Serves an [`InMemoryRemote`] over the HTTP server contract, so that
//! [`HttpRemote`](super::HttpRemote) clients in separate processes share one
//! server of record.
//!
//! ```text
//! GET  /health              → "OK"
//! GET  /{entity_type}/{id}  → 200 ServerDocument | 404
//! PUT  /{entity_type}/{id}  → 200 ServerDocument | 400 | 409 {versionNumber}
//! ```

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::{header::IF_MATCH, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use quote_core::{ServerDocument, SyncDocument};

use super::{InMemoryRemote, RemoteDocuments};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Router
// =============================================================================

/// Builds the routes for one document type.
pub fn document_router<T: SyncDocument>(remote: InMemoryRemote<T>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            &format!("/{}/{{id}}", T::ENTITY_TYPE),
            get(fetch_handler::<T>).put(store_handler::<T>),
        )
        .with_state(remote)
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn fetch_handler<T: SyncDocument>(
    State(remote): State<InMemoryRemote<T>>,
    Path(id): Path<String>,
) -> Result<Json<ServerDocument<T>>, ApiError> {
    Ok(Json(remote.fetch(&id).await?))
}

async fn store_handler<T: SyncDocument>(
    State(remote): State<InMemoryRemote<T>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<Json<ServerDocument<T>>, ApiError> {
    let expected = body
        .get("versionNumber")
        .and_then(Value::as_i64)
        .or_else(|| if_match_version(&headers))
        .unwrap_or(0);

    if let Some(fields) = body.as_object_mut() {
        fields.remove("versionNumber");
        fields.remove("updatedAt");
    }

    let doc: T = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid {}: {}", T::ENTITY_TYPE, e)))?;
    if doc.id() != id {
        return Err(ApiError::BadRequest(format!(
            "Body id '{}' does not match path id '{}'",
            doc.id(),
            id
        )));
    }

    debug!(entity_type = T::ENTITY_TYPE, entity_id = %id, expected, "PUT received");
    Ok(Json(remote.store(&doc, expected).await?))
}

/// Parses `If-Match: "<n>"`.
fn if_match_version(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(IF_MATCH)?
        .to_str()
        .ok()?
        .trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

// =============================================================================
// Error Mapping
// =============================================================================

enum ApiError {
    BadRequest(String),
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::Sync(SyncError::NotFound { entity_type, id }) => {
                (StatusCode::NOT_FOUND, format!("{} not found: {}", entity_type, id)).into_response()
            }
            ApiError::Sync(SyncError::VersionMismatch { actual, .. }) => {
                (StatusCode::CONFLICT, Json(json!({ "versionNumber": actual }))).into_response()
            }
            ApiError::Sync(SyncError::ServerStatus { status, message }) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, message).into_response()
            }
            ApiError::Sync(SyncError::ConnectionFailed(message)) => {
                (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
            }
            ApiError::Sync(other) => {
                warn!(error = %other, "Unhandled document server error");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
            }
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server of record for one document type.
pub struct DocumentServer<T> {
    remote: InMemoryRemote<T>,
    bind_address: String,
}

/// Handle for a running [`DocumentServer`].
#[derive(Debug, Clone)]
pub struct DocumentServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl DocumentServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL for an [`HttpRemote`](super::HttpRemote).
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Shuts down the server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Document server shutdown channel closed".into()))
    }
}

impl<T: SyncDocument> DocumentServer<T> {
    /// Creates a server for `remote` on `bind_address` (`host:port`).
    pub fn new(remote: InMemoryRemote<T>, bind_address: impl Into<String>) -> Self {
        DocumentServer {
            remote,
            bind_address: bind_address.into(),
        }
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self) -> SyncResult<DocumentServerHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;
        let app = document_router(self.remote);

        info!(addr = %local_addr, entity_type = T::ENTITY_TYPE, "Document server started");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Document server shutting down");
                })
                .await
                .ok();
        });

        Ok(DocumentServerHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::HttpRemote;
    use quote_core::Quotation;
    use std::time::Duration;

    async fn start() -> (InMemoryRemote<Quotation>, DocumentServerHandle, HttpRemote<Quotation>) {
        let remote = InMemoryRemote::<Quotation>::new();
        let handle = DocumentServer::new(remote.clone(), "127.0.0.1:0")
            .start()
            .await
            .unwrap();
        let client = HttpRemote::<Quotation>::new(&handle.base_url(), Duration::from_secs(5)).unwrap();
        (remote, handle, client)
    }

    #[test]
    fn test_if_match_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(if_match_version(&headers), None);

        headers.insert(IF_MATCH, "\"7\"".parse().unwrap());
        assert_eq!(if_match_version(&headers), Some(7));

        headers.insert(IF_MATCH, "W/\"3\"".parse().unwrap());
        assert_eq!(if_match_version(&headers), Some(3));
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let (remote, handle, client) = start().await;
        let q = Quotation::new("Q-1", "Fit-out", "Acme");

        let stored = client.store(&q, 0).await.unwrap();
        assert_eq!(stored.version_number, 1);
        assert_eq!(stored.data, q);
        assert_eq!(remote.document(&q.id).unwrap().version_number, 1);

        let fetched = client.fetch(&q.id).await.unwrap();
        assert_eq!(fetched.data, q);
        assert_eq!(fetched.version_number, 1);

        client.ping().await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_errors_map_to_sync_errors() {
        let (remote, handle, client) = start().await;
        let q = Quotation::new("Q-1", "Fit-out", "Acme");

        assert!(matches!(
            client.fetch("missing").await.unwrap_err(),
            SyncError::NotFound { .. }
        ));

        remote.seed(q.clone(), 4);
        match client.store(&q, 2).await.unwrap_err() {
            SyncError::VersionMismatch { expected, actual, .. } => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        remote.set_failing(true);
        assert!(matches!(
            client.fetch(&q.id).await.unwrap_err(),
            SyncError::ServerStatus { status: 500, .. }
        ));

        handle.shutdown().await.unwrap();
    }
}
