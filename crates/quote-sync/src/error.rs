//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Broadcast Bus       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Offline        │  │  BusUnavailable         │ │
//! │  │  InvalidUrl     │  │  ConnectionFail │  │  Disconnected           │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │  WebSocketError         │ │
//! │  │                 │  │  ServerStatus   │  │  BusClosed              │ │
//! │  │                 │  │  NotFound       │  │                         │ │
//! │  │                 │  │  VersionMismatch│  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  These stay inside the crate. Public pull/push/sync operations turn   │
//! │  them into outcome values and a `lastError` message on the entity.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid server or relay URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The process is offline; no request was sent.
    #[error("Offline")]
    Offline,

    /// Failed to reach the server or relay.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request timed out.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Any other transport failure.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Non-success HTTP status.
    #[error("Server responded {status}: {message}")]
    ServerStatus { status: u16, message: String },

    /// The server has no such document.
    #[error("{entity_type} not found on server: {id}")]
    NotFound { entity_type: String, id: String },

    /// The server rejected a write because its version moved.
    #[error("Version mismatch for {entity_id}: expected {expected}, server at {actual}")]
    VersionMismatch {
        entity_id: String,
        expected: i64,
        actual: i64,
    },

    // =========================================================================
    // Bus Errors
    // =========================================================================
    /// No transport is available for the broadcast bus.
    #[error("Broadcast bus unavailable: {0}")]
    BusUnavailable(String),

    /// The bus was closed.
    #[error("Broadcast bus closed")]
    BusClosed,

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from relay")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// Failed to serialize a message or document.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize a message or document.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// A local cache write was rejected.
    #[error("Local cache write failed for {0}")]
    StorageFailed(String),

    /// The local copy fails validation and cannot be sent yet.
    #[error("{id} is not ready to push: {reason}")]
    InvalidDocument { id: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Session is shutting down.
    #[error("Sync session is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

/// Convert reqwest errors to SyncError.
///
/// ## Error Mapping
/// ```text
/// connect failure   → ConnectionFailed
/// timeout           → Timeout
/// body decode       → DeserializationFailed
/// status error      → ServerStatus
/// other             → RequestFailed
/// ```
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::DeserializationFailed(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::ServerStatus {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::RequestFailed(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed if retried later.
    ///
    /// ## Retryable Errors
    /// - Offline, connection failures, timeouts
    /// - Server-side (5xx) failures
    /// - Relay disconnections
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - 4xx responses, missing documents
    /// - Version mismatches (they need conflict resolution, not a retry)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Offline
            | SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::RequestFailed(_)
            | SyncError::Disconnected
            | SyncError::WebSocketError(_) => true,
            SyncError::ServerStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error came from talking to the server.
    ///
    /// These are the faults that move a dirty entity to `error`.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            SyncError::Offline
                | SyncError::ConnectionFailed(_)
                | SyncError::Timeout(_)
                | SyncError::RequestFailed(_)
                | SyncError::ServerStatus { .. }
                | SyncError::DeserializationFailed(_)
        )
    }
}
