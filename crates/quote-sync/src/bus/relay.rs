//! # WebSocket Relay
//!
//! Carries broadcast events between processes that do not share memory.
//! One [`RelayServer`] per machine fans out text frames to every socket
//! joined to the same session; each process connects a [`RelayTransport`].
//!
//! ## Topology
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RelayServer (Axum)                               │
//! │                                                                         │
//! │   /bus/{session} ──▶ WebSocket upgrade                                  │
//! │                           │                                             │
//! │              ┌────────────┴────────────┐                                │
//! │              ▼                         ▼                                │
//! │     session "default"           session "team-b"                        │
//! │     broadcast::Sender           broadcast::Sender                       │
//! │      │        │      │               │                                  │
//! │      ▼        ▼      ▼               ▼                                  │
//! │    tab 1    tab 2   cli            tab 3       (never echoed to sender) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Client Connection Lifecycle
//! ```text
//!  Disconnected ──open()──► Connecting ──ok──► Connected
//!       ▲                       │                  │
//!       │                    failure         error / close
//!       │                       ▼                  │
//!       └──── shutdown ──── Backoff ◄──────────────┘
//!                      (500ms, 1s, 2s ... max 60s)
//! ```
//! Events published while disconnected are queued up to the outgoing
//! capacity and dropped beyond it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use quote_core::BroadcastEvent;

use super::BusTransport;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Constants
// =============================================================================

/// Default relay port.
pub const DEFAULT_RELAY_PORT: u16 = 8766;

/// Largest accepted frame (64KB); events are small.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Events queued for sending while disconnected.
const OUTGOING_CAPACITY: usize = 100;

// =============================================================================
// Relay Server
// =============================================================================

type Frame = (u64, Arc<str>);

struct RelayState {
    sessions: RwLock<HashMap<String, broadcast::Sender<Frame>>>,
    capacity: usize,
    next_connection: AtomicU64,
}

impl RelayState {
    async fn join(&self, session: &str) -> broadcast::Sender<Frame> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    async fn prune(&self, session: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(session).is_some_and(|tx| tx.receiver_count() == 0) {
            sessions.remove(session);
            debug!(session = %session, "Session closed");
        }
    }
}

/// WebSocket server relaying broadcast events within sessions.
pub struct RelayServer {
    bind_address: String,
    state: Arc<RelayState>,
}

/// Handle for controlling a running relay.
#[derive(Clone)]
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RelayServerHandle {
    /// Address the relay is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base `ws://` URL for [`RelayConfig::new`].
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Number of sessions with at least one connection.
    pub async fn session_count(&self) -> usize {
        self.state.sessions.read().await.len()
    }

    /// Shuts down the relay.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Relay shutdown channel closed".into()))
    }
}

impl RelayServer {
    /// Creates a relay bound to `bind_address` (`host:port`).
    pub fn new(bind_address: impl Into<String>, channel_capacity: usize) -> Self {
        RelayServer {
            bind_address: bind_address.into(),
            state: Arc::new(RelayState {
                sessions: RwLock::new(HashMap::new()),
                capacity: channel_capacity.max(1),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Starts the relay and returns a handle.
    pub async fn start(self) -> SyncResult<RelayServerHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Router::new()
            .route("/bus/{session}", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Relay server started");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Relay server shutting down");
                })
                .await
                .ok();
        });

        Ok(RelayServerHandle {
            local_addr,
            state: self.state,
            shutdown_tx,
        })
    }
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, session))
}

/// Relays one connection's frames to its session.
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, session: String) {
    let connection_id = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let session_tx = state.join(&session).await;
    let mut session_rx = session_tx.subscribe();

    info!(session = %session, connection_id, "Relay client joined");

    let (mut sender, mut receiver) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(64);

    // Outgoing message task
    let outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Session forwarding task
    let forward_tx = outgoing_tx.clone();
    let forward_session = session.clone();
    let forward_handle = tokio::spawn(async move {
        loop {
            match session_rx.recv().await {
                Ok((from, _)) if from == connection_id => continue,
                Ok((_, text)) => {
                    if forward_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(session = %forward_session, connection_id, missed, "Relay client lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                // Only well-formed events are relayed
                match BroadcastEvent::from_json(text.as_str()) {
                    Ok(event) => {
                        debug!(session = %session, kind = ?event.kind, entity_id = %event.entity_id, "Relaying event");
                        let _ = session_tx.send((connection_id, Arc::from(text.as_str())));
                    }
                    Err(e) => {
                        debug!(session = %session, connection_id, ?e, "Invalid event frame");
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = outgoing_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => {
                info!(session = %session, connection_id, "Relay client requested close");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(session = %session, connection_id, ?e, "Relay WebSocket error");
                break;
            }
            None => {
                info!(session = %session, connection_id, "Relay client disconnected");
                break;
            }
        }
    }

    // Cleanup
    forward_handle.abort();
    outgoing_handle.abort();
    let _ = forward_handle.await;
    drop(session_tx);
    state.prune(&session).await;
}

// =============================================================================
// Relay Client
// =============================================================================

/// Connection state of a [`RelayTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
        }
    }
}

/// Configuration for a [`RelayTransport`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Full session URL, e.g. `ws://127.0.0.1:8766/bus/default`.
    pub url: Url,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,

    /// Incoming events buffered per receiver.
    pub channel_capacity: usize,
}

impl RelayConfig {
    /// Builds the session URL `{relay_url}/bus/{session_id}`.
    pub fn new(relay_url: &str, session_id: &str) -> SyncResult<Self> {
        let mut url = Url::parse(relay_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "Relay URL must start with ws:// or wss://, got: {}",
                relay_url
            )));
        }
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(relay_url.to_string()))?
            .pop_if_empty()
            .push("bus")
            .push(session_id);

        Ok(RelayConfig {
            url,
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            channel_capacity: super::local::DEFAULT_CHANNEL_CAPACITY,
        })
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

/// Bus transport over a WebSocket connection to a [`RelayServer`].
///
/// The background connection task starts on the first `open` and
/// reconnects with exponential backoff until `close`.
pub struct RelayTransport {
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    incoming: broadcast::Sender<BroadcastEvent>,
    outgoing_tx: mpsc::Sender<BroadcastEvent>,
    shutdown_tx: mpsc::Sender<()>,
    worker: Mutex<Option<RelayWorker>>,
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("url", &self.config.url.as_str())
            .finish()
    }
}

impl RelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        let (incoming, _) = broadcast::channel(config.channel_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let worker = RelayWorker {
            config: config.clone(),
            state: state.clone(),
            incoming: incoming.clone(),
            outgoing_rx,
            shutdown_rx,
        };

        RelayTransport {
            config,
            state,
            incoming,
            outgoing_tx,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns true if currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }
}

#[async_trait]
impl BusTransport for RelayTransport {
    async fn open(&self) -> SyncResult<broadcast::Receiver<BroadcastEvent>> {
        let rx = self.incoming.subscribe();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            tokio::spawn(worker.run());
        }
        Ok(rx)
    }

    async fn send(&self, event: &BroadcastEvent) -> SyncResult<()> {
        self.outgoing_tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::ChannelError("Relay outgoing queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => SyncError::BusClosed,
        })
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

/// Background connection loop of a [`RelayTransport`].
struct RelayWorker {
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    incoming: broadcast::Sender<BroadcastEvent>,
    outgoing_rx: mpsc::Receiver<BroadcastEvent>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RelayWorker {
    async fn run(mut self) {
        info!(url = %self.config.url, "Relay transport starting");

        let mut backoff = self.create_backoff();

        loop {
            if !matches!(self.shutdown_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)) {
                break;
            }

            *self.state.write().await = ConnectionState::Connecting;

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!(url = %self.config.url, "Relay connected");
                    *self.state.write().await = ConnectionState::Connected;
                    backoff.reset();

                    match self.connection_loop(ws_stream).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Relay connection lost"),
                    }
                }
                Err(e) => {
                    error!(error = %e, url = %self.config.url, "Failed to connect to relay");
                }
            }

            *self.state.write().await = ConnectionState::Backoff;

            let Some(wait) = backoff.next_backoff() else {
                error!("Relay backoff exhausted");
                break;
            };
            debug!(?wait, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown during backoff");
                    break;
                }
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
        info!("Relay transport stopped");
    }

    async fn connect_with_timeout(&self) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        match timeout(self.config.connect_timeout, connect_async(self.config.url.as_str())).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "Relay handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(format!(
                "connecting to relay after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Pumps one connection. Returns `Ok(true)` on shutdown.
    async fn connection_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SyncResult<bool> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.outgoing_rx.recv() => {
                    let json = event.to_json()?;
                    write.send(WsMessage::Text(json.into())).await?;
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match BroadcastEvent::from_json(text.as_str()) {
                            Ok(event) => {
                                // No local receivers is fine
                                let _ = self.incoming.send(event);
                            }
                            Err(e) => warn!(?e, "Failed to parse relayed event"),
                        },
                        Some(Ok(WsMessage::Ping(data))) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "Relay closed the connection");
                            return Ok(false);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(SyncError::from(e)),
                        None => return Err(SyncError::Disconnected),
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(Default::default())).await?;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing relay connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
