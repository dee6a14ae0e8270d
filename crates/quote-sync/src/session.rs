//! # Sync Session
//!
//! Per-process orchestrator: owns the bus endpoint, the coordinator, the
//! auto-save scheduler and the background tasks, with an explicit
//! start/shutdown lifecycle so independent sessions never share state.
//!
//! ## Session Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncSession Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncSession<T>                           │  │
//! │  │                                                                  │  │
//! │  │  • on_visibility_change / on_teardown / save_now (UI triggers)  │  │
//! │  │  • pull / push / sync_all (explicit operations)                  │  │
//! │  │  • Emits status, conflicts and sibling changes to the UI         │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ spawns on start()                       │
//! │      ┌──────────────┬─────────┴────────┬──────────────────┐            │
//! │      ▼              ▼                  ▼                  ▼             │
//! │  ┌──────────┐ ┌────────────┐ ┌──────────────────┐ ┌──────────────┐     │
//! │  │ AutoSave │ │ Sync loop  │ │ Bus listener     │ │ Connectivity │     │
//! │  │ scheduler│ │ interval + │ │ sibling events,  │ │ ping (opt.)  │     │
//! │  │          │ │ backoff,   │ │ request_state    │ │ ping → online│     │
//! │  │          │ │ reconnect  │ │ answers          │ │              │     │
//! │  └──────────┘ └────────────┘ └──────────────────┘ └──────────────┘     │
//! │                                                                         │
//! │  UI EVENTS (SyncEventEmitter):                                         │
//! │  ─────────────────────────────                                         │
//! │  emit_status         - online, bus, dirty count, last error            │
//! │  emit_conflict       - ConflictInfo for a push that stopped            │
//! │  emit_remote_change  - a sibling changed or synced an entity           │
//! │  emit_error          - a pull or push failed                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quote_core::{BroadcastEvent, BroadcastEventKind, ConflictInfo, ResolutionStrategy, SyncDocument};
use quote_store::EntityCache;

use crate::autosave::{AutoSaveHandle, AutoSaveScheduler, AutoSaveTiming, AutoSaver, FlushReason, SaveOutcome};
use crate::bus::{BroadcastBus, BusTransport, LocalChannel, RelayConfig, RelayTransport, Subscription};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::{ConflictResolver, PullOutcome, PushOutcome, SyncCoordinator, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::remote::{HttpRemote, RemoteDocuments};

/// Entity id in a `request_state` event that asks about every entity.
pub const ALL_ENTITIES: &str = "*";

// =============================================================================
// Session Status
// =============================================================================

/// Current session status for external queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    /// Connectivity as last reported.
    pub online: bool,

    /// Whether the broadcast bus is delivering events.
    pub bus_ready: bool,

    /// Whether timer-driven auto-save is paused.
    pub auto_save_paused: bool,

    /// Cached entities with local changes.
    pub dirty_count: usize,

    /// Last time a push or pull completed.
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Last error message (if any).
    pub last_error: Option<String>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives session events for presentation.
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a session status change.
    fn emit_status(&self, status: &SessionStatus);

    /// Emits a conflict that needs the user's attention.
    fn emit_conflict(&self, conflict: &ConflictInfo);

    /// Emits a change announced by a sibling process.
    fn emit_remote_change(&self, event: &BroadcastEvent);

    /// Emits a failed sync operation.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SessionStatus) {}
    fn emit_conflict(&self, _conflict: &ConflictInfo) {}
    fn emit_remote_change(&self, _event: &BroadcastEvent) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Shared State
// =============================================================================

/// State reachable from the background tasks.
struct Shared<T: SyncDocument> {
    config: Arc<SyncConfig>,
    coordinator: SyncCoordinator<T>,
    bus: BroadcastBus,
    resolver: Option<Arc<dyn ConflictResolver>>,
    emitter: Arc<dyn SyncEventEmitter>,
    status: RwLock<SessionStatus>,
    editor: Option<watch::Sender<T>>,
    autosave: OnceLock<AutoSaveHandle<T>>,
}

impl<T: SyncDocument> Shared<T> {
    fn cache(&self) -> &EntityCache<T> {
        self.coordinator.cache()
    }

    fn editor_id(&self) -> Option<String> {
        self.editor.as_ref().map(|tx| tx.borrow().id().to_string())
    }

    /// Hands a server copy now in the cache to the editor. The auto-saver
    /// is rebased first so the replacement is not taken for a local edit.
    fn adopt(&self, doc: &T) {
        if let Some(autosave) = self.autosave.get() {
            autosave.rebase(doc);
        }
        if let Some(editor) = &self.editor {
            let replaced = editor.send_if_modified(|current| {
                if current.id() == doc.id() && *current != *doc {
                    *current = doc.clone();
                    true
                } else {
                    false
                }
            });
            if replaced {
                debug!(entity_id = %doc.id(), "Editor now shows the server copy");
            }
        }
    }

    async fn pull(&self, id: &str) -> PullOutcome<T> {
        // Unsaved editor changes go to the cache first; a pull never replaces dirty data
        if self.editor_id().as_deref() == Some(id) {
            if let Some(autosave) = self.autosave.get() {
                autosave.flush(FlushReason::Manual).await;
            }
        }

        let outcome = self.coordinator.pull(id).await;
        match &outcome {
            PullOutcome::Updated(server) => {
                self.adopt(&server.data);
                self.status.write().await.last_sync_at = Some(Utc::now());
            }
            PullOutcome::Failed { error, .. } => self.record_error(error).await,
            _ => {}
        }
        self.publish_status().await;
        outcome
    }

    async fn push(&self, id: &str, resolver: Option<&dyn ConflictResolver>) -> PushOutcome {
        let outcome = self.coordinator.push(id, resolver).await;
        self.record_push(id, &outcome).await;
        self.publish_status().await;
        outcome
    }

    async fn sync_all(&self) -> SyncReport {
        let report = self.coordinator.sync_all_dirty(self.resolver.as_deref()).await;
        for (id, outcome) in &report.outcomes {
            self.record_push(id, outcome).await;
        }
        self.publish_status().await;
        report
    }

    async fn record_push(&self, id: &str, outcome: &PushOutcome) {
        match outcome {
            PushOutcome::Pushed { .. } => {
                self.status.write().await.last_sync_at = Some(Utc::now());
            }
            PushOutcome::Resolved { strategy, .. } => {
                self.status.write().await.last_sync_at = Some(Utc::now());
                // keep-server replaced the local copy; the editor adopts it
                if *strategy == ResolutionStrategy::KeepServer {
                    if let Some(doc) = self.cache().get(id).await {
                        self.adopt(&doc);
                    }
                }
            }
            PushOutcome::Conflict(info) | PushOutcome::Cancelled(info) => {
                self.emitter.emit_conflict(info);
            }
            PushOutcome::Failed(error) => self.record_error(error).await,
            PushOutcome::Clean | PushOutcome::Offline | PushOutcome::InFlight => {}
        }
    }

    async fn record_error(&self, error: &str) {
        self.status.write().await.last_error = Some(error.to_string());
        self.emitter.emit_error(error, true);
    }

    async fn publish_status(&self) {
        let dirty_count = self.cache().dirty_ids().await.len();
        let status = {
            let mut status = self.status.write().await;
            status.online = self.coordinator.connectivity().is_online();
            status.bus_ready = self.bus.is_ready();
            status.dirty_count = dirty_count;
            status.clone()
        };
        self.emitter.emit_status(&status);
    }

    /// Reacts to an event from a sibling process.
    async fn handle_event(&self, event: BroadcastEvent) {
        debug!(kind = ?event.kind, entity_id = %event.entity_id, origin = %event.origin_id, "Sibling event");

        match event.kind {
            BroadcastEventKind::RequestState => self.answer_state_request(&event.entity_id).await,
            BroadcastEventKind::SyncCompleted | BroadcastEventKind::ConflictResolved => {
                // Re-read rather than trust the event; a pull never touches dirty data
                let cached = self.cache().get_with_meta(&event.entity_id).await;
                let clean = cached.is_some_and(|c| !c.metadata.is_dirty);
                if clean && self.coordinator.connectivity().is_online() {
                    self.pull(&event.entity_id).await;
                }
                self.emitter.emit_remote_change(&event);
            }
            BroadcastEventKind::EntityUpdated | BroadcastEventKind::ConflictDetected => {
                self.emitter.emit_remote_change(&event);
            }
        }
    }

    async fn answer_state_request(&self, entity_id: &str) {
        let ids = if entity_id == ALL_ENTITIES {
            self.cache().dirty_ids().await
        } else if self.cache().is_dirty(entity_id).await {
            vec![entity_id.to_string()]
        } else {
            Vec::new()
        };

        for id in ids {
            self.bus
                .publish(self.bus.event(BroadcastEventKind::EntityUpdated, id))
                .await;
        }
    }
}

// =============================================================================
// Sync Session
// =============================================================================

/// Orchestrates local-first sync for one document type in one process.
pub struct SyncSession<T: SyncDocument> {
    shared: Arc<Shared<T>>,
    ping_interval: Option<Duration>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl<T: SyncDocument> fmt::Debug for SyncSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("origin_id", &self.shared.bus.origin_id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<T: SyncDocument> SyncSession<T> {
    /// Returns a builder.
    pub fn builder(config: SyncConfig) -> SyncSessionBuilder<T> {
        SyncSessionBuilder::new(config)
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn bus(&self) -> &BroadcastBus {
        &self.shared.bus
    }

    pub fn coordinator(&self) -> &SyncCoordinator<T> {
        &self.shared.coordinator
    }

    pub fn cache(&self) -> &EntityCache<T> {
        self.shared.cache()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.shared.coordinator.connectivity()
    }

    /// The in-memory document the UI edits, if one is attached.
    ///
    /// Edits go through `send_modify`/`send_replace`. The session replaces
    /// the value itself when it adopts a server copy; `subscribe()` to see
    /// those replacements.
    pub fn editor(&self) -> Option<&watch::Sender<T>> {
        self.shared.editor.as_ref()
    }

    /// Returns the current session status.
    pub async fn status(&self) -> SessionStatus {
        self.shared.publish_status().await;
        self.shared.status.read().await.clone()
    }

    /// Starts the bus, the auto-save scheduler and the background tasks.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let config = self.shared.config.clone();
        config.validate()?;

        info!(
            entity_type = T::ENTITY_TYPE,
            origin_id = %self.shared.bus.origin_id(),
            session_id = %config.session.session_id,
            "Starting sync session"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Broadcast bus
        if config.sync.enable_cross_process_sync && self.shared.bus.init().await {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            self.subscription = Some(self.shared.bus.subscribe(move |event| {
                let _ = events_tx.send(event.clone());
            }));
            self.tasks.push(tokio::spawn(bus_listener(
                self.shared.clone(),
                events_rx,
                shutdown_rx.clone(),
            )));
        } else {
            info!("Cross-process sync disabled for this session");
        }

        // Auto-save
        if let Some(editor) = &self.shared.editor {
            let mut saver = AutoSaver::new(self.shared.cache().clone());
            if self.shared.bus.is_ready() {
                saver = saver.with_bus(self.shared.bus.clone());
            }

            // A document that already matches the cache is not an edit
            let current = editor.borrow().clone();
            if self.shared.cache().get(current.id()).await.as_ref() == Some(&current) {
                saver.rebase(&current);
            }

            let timing = AutoSaveTiming {
                interval: config.auto_save_interval(),
                debounce: config.auto_save_debounce(),
                max_wait: config.auto_save_max_wait(),
            };
            let handle = AutoSaveScheduler::spawn(Arc::new(saver), editor.subscribe(), timing, !config.auto_save_enabled());
            if self.shared.autosave.set(handle).is_err() {
                warn!("Auto-save scheduler already attached");
            }
        }

        // Periodic sync
        let online_rx = self.connectivity().subscribe();
        self.tasks.push(tokio::spawn(sync_loop(
            self.shared.clone(),
            online_rx,
            shutdown_rx.clone(),
        )));

        // Connectivity ping
        if let Some(every) = self.ping_interval {
            self.tasks.push(tokio::spawn(ping_loop(self.shared.clone(), every, shutdown_rx)));
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.shared.publish_status().await;

        info!("Sync session started");
        Ok(())
    }

    /// Stops the background tasks and closes the bus.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        info!("Shutting down sync session");

        let _ = shutdown_tx.send(true);
        if let Some(autosave) = self.shared.autosave.get() {
            let _ = autosave.shutdown().await;
        }
        self.subscription = None;
        self.shared.bus.close().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }

        info!("Sync session stopped");
        Ok(())
    }

    // =========================================================================
    // UI Triggers
    // =========================================================================

    /// The process became hidden or visible again.
    pub async fn on_visibility_change(&self, hidden: bool) {
        let Some(id) = self.editor_id() else {
            return;
        };

        if hidden {
            if let Some(autosave) = self.shared.autosave.get() {
                autosave.on_hidden().await;
            }
            if self.shared.config.sync.sync_on_visibility_change {
                self.shared.push(&id, self.shared.resolver.as_deref()).await;
            }
        } else if self.shared.config.sync.sync_on_visibility_change {
            self.shared.pull(&id).await;
        }
    }

    /// The process is about to be torn down; saves the editor's document.
    pub async fn on_teardown(&self) -> SaveOutcome {
        match self.shared.autosave.get() {
            Some(autosave) => autosave.on_teardown().await,
            None => SaveOutcome::Unchanged,
        }
    }

    /// Applies the user's auto-save preference.
    pub async fn set_user_auto_save(&self, enabled: bool) {
        if !self.shared.config.sync.respect_user_auto_save_preference {
            debug!(enabled, "User auto-save preference ignored by configuration");
            return;
        }
        if let Some(autosave) = self.shared.autosave.get() {
            if enabled {
                autosave.resume().await;
            } else {
                autosave.pause().await;
            }
        }
        self.shared.status.write().await.auto_save_paused = !enabled;
        self.shared.publish_status().await;
    }

    /// Saves the editor's document and pushes it.
    pub async fn save_now(&self) -> PushOutcome {
        let Some(id) = self.editor_id() else {
            return PushOutcome::Clean;
        };
        if let Some(autosave) = self.shared.autosave.get() {
            if autosave.flush(FlushReason::Manual).await == SaveOutcome::Failed {
                let error = format!("local cache write failed for {}", id);
                self.shared.record_error(&error).await;
                return PushOutcome::Failed(error);
            }
        }
        self.shared.push(&id, self.shared.resolver.as_deref()).await
    }

    // =========================================================================
    // Explicit Operations
    // =========================================================================

    pub async fn pull(&self, id: &str) -> PullOutcome<T> {
        self.shared.pull(id).await
    }

    /// Pushes `id`, using `resolver` or the session's resolver on conflict.
    pub async fn push(&self, id: &str, resolver: Option<&dyn ConflictResolver>) -> PushOutcome {
        let resolver = resolver.or(self.shared.resolver.as_deref());
        self.shared.push(id, resolver).await
    }

    pub async fn sync_all(&self) -> SyncReport {
        self.shared.sync_all().await
    }

    /// Asks sibling processes to re-announce their unsynced entities.
    pub async fn request_state(&self, entity_id: &str) -> bool {
        let bus = &self.shared.bus;
        bus.publish(bus.event(BroadcastEventKind::RequestState, entity_id))
            .await
    }

    fn editor_id(&self) -> Option<String> {
        self.shared.editor_id()
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Pushes dirty entities on an interval, backing off after failures, and
/// re-syncs once connectivity returns after a long outage.
async fn sync_loop<T: SyncDocument>(
    shared: Arc<Shared<T>>,
    mut online_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let base = shared.config.sync_interval();
    let mut backoff = ExponentialBackoff {
        initial_interval: shared.config.initial_backoff(),
        max_interval: shared.config.max_backoff(),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    let mut delay = base;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if !shared.coordinator.connectivity().is_online() {
                    delay = base;
                    continue;
                }
                let report = shared.sync_all().await;
                delay = if report.failed() > 0 {
                    let wait = backoff.next_backoff().unwrap_or(shared.config.max_backoff());
                    debug!(?wait, failed = report.failed(), "Sync failures; backing off");
                    wait
                } else {
                    backoff.reset();
                    base
                };
            }

            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                shared.publish_status().await;
                if online && shared.coordinator.connectivity().take_reconnect(shared.config.max_offline_time()) {
                    info!("Back online after a long outage; re-syncing");
                    shared.sync_all().await;
                }
            }

            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("Sync loop stopped");
}

/// Feeds the connectivity monitor from server pings.
async fn ping_loop<T: SyncDocument>(shared: Arc<Shared<T>>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reachable = shared.coordinator.ping().await;
                shared.coordinator.connectivity().set_online(reachable);
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("Connectivity ping stopped");
}

/// Handles events from sibling processes.
async fn bus_listener<T: SyncDocument>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<BroadcastEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event).await,
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("Bus listener stopped");
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a [`SyncSession`] with options.
pub struct SyncSessionBuilder<T: SyncDocument> {
    config: SyncConfig,
    cache: Option<EntityCache<T>>,
    remote: Option<Arc<dyn RemoteDocuments<T>>>,
    transport: Option<Arc<dyn BusTransport>>,
    connectivity: Option<ConnectivityMonitor>,
    editor: Option<T>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    ping_interval: Option<Duration>,
}

impl<T: SyncDocument> SyncSessionBuilder<T> {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncSessionBuilder {
            config,
            cache: None,
            remote: None,
            transport: None,
            connectivity: None,
            editor: None,
            resolver: None,
            emitter: None,
            ping_interval: None,
        }
    }

    /// Sets the entity cache.
    pub fn with_cache(mut self, cache: EntityCache<T>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the server of record. Defaults to HTTP at `sync.server_url`.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteDocuments<T>>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the bus transport. Defaults to the relay at `bus.relay_url`,
    /// else an in-process channel.
    pub fn with_transport(mut self, transport: Arc<dyn BusTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the connectivity monitor, e.g. one shared with the runtime.
    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Attaches the document the UI edits; enables auto-save. The session
    /// owns the value from here on, see [`SyncSession::editor`].
    pub fn with_editor(mut self, document: T) -> Self {
        self.editor = Some(document);
        self
    }

    /// Sets the resolver used by background and UI-triggered pushes.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Pings the server every `every` to track connectivity.
    pub fn with_connectivity_ping(mut self, every: Duration) -> Self {
        self.ping_interval = Some(every);
        self
    }

    /// Builds the session.
    pub fn build(self) -> SyncResult<SyncSession<T>> {
        self.config.validate()?;

        let cache = self
            .cache
            .ok_or_else(|| SyncError::InvalidConfig("Entity cache required".into()))?;

        let remote: Arc<dyn RemoteDocuments<T>> = match self.remote {
            Some(remote) => remote,
            None => {
                let url = self.config.server_url().ok_or_else(|| {
                    SyncError::InvalidConfig("Server URL required when no remote is supplied".into())
                })?;
                Arc::new(HttpRemote::<T>::new(url, self.config.request_timeout())?)
            }
        };

        let bus = if !self.config.sync.enable_cross_process_sync {
            BroadcastBus::unavailable()
        } else {
            let transport: Arc<dyn BusTransport> = match (self.transport, self.config.relay_url()) {
                (Some(transport), _) => transport,
                (None, Some(relay_url)) => {
                    let relay = RelayConfig::new(relay_url, &self.config.session.session_id)?
                        .with_backoff(self.config.initial_backoff(), self.config.max_backoff())
                        .with_channel_capacity(self.config.bus.channel_capacity);
                    Arc::new(RelayTransport::new(relay))
                }
                (None, None) => Arc::new(LocalChannel::new(self.config.bus.channel_capacity)),
            };
            BroadcastBus::new(transport).with_clock(cache.store().clock().clone())
        };

        let connectivity = self
            .connectivity
            .unwrap_or_else(|| ConnectivityMonitor::with_clock(true, cache.store().clock().clone()));

        let coordinator = SyncCoordinator::new(cache, remote, connectivity)
            .with_bus(bus.clone())
            .with_push_timeout(self.config.push_in_flight_timeout());

        let status = SessionStatus {
            auto_save_paused: !self.config.auto_save_enabled(),
            ..Default::default()
        };

        let shared = Shared {
            config: Arc::new(self.config),
            coordinator,
            bus,
            resolver: self.resolver,
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
            status: RwLock::new(status),
            editor: self.editor.map(|document| watch::channel(document).0),
            autosave: OnceLock::new(),
        };

        Ok(SyncSession {
            shared: Arc::new(shared),
            ping_interval: self.ping_interval,
            shutdown_tx: None,
            tasks: Vec::new(),
            subscription: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use quote_core::{ManualClock, Quotation, ResolutionStrategy, SyncStatus};
    use quote_store::{MemoryBackend, PersistentStore};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingEmitter {
        conflicts: Mutex<Vec<ConflictInfo>>,
        errors: Mutex<Vec<String>>,
        remote_changes: Mutex<Vec<BroadcastEvent>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, _status: &SessionStatus) {}

        fn emit_conflict(&self, conflict: &ConflictInfo) {
            self.conflicts.lock().unwrap().push(conflict.clone());
        }

        fn emit_remote_change(&self, event: &BroadcastEvent) {
            self.remote_changes.lock().unwrap().push(event.clone());
        }

        fn emit_error(&self, message: &str, _retryable: bool) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn cache_on(backend: &MemoryBackend, clock: &ManualClock) -> EntityCache<Quotation> {
        let store = PersistentStore::new(Arc::new(backend.clone()), "test").with_clock(Arc::new(clock.clone()));
        EntityCache::new(store)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_build_requires_cache() {
        let err = SyncSession::<Quotation>::builder(SyncConfig::new()).build().unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_build_requires_remote_or_url() {
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());
        let err = SyncSession::builder(SyncConfig::new())
            .with_cache(cache)
            .build()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_save_now_flushes_and_pushes() {
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let remote = InMemoryRemote::<Quotation>::new();
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());

        let mut session = SyncSession::builder(SyncConfig::new())
            .with_cache(cache.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_editor(q.clone())
            .build()
            .unwrap();
        session.start().await.unwrap();

        session.editor().unwrap().send_modify(|doc| doc.title = "Kitchen remodel".into());
        assert_eq!(session.save_now().await, PushOutcome::Pushed { version: 1 });
        assert_eq!(remote.document(&q.id).unwrap().data.title, "Kitchen remodel");
        assert_eq!(cache.get_sync_status(&q.id).await, Some(SyncStatus::Synced));

        let status = session.status().await;
        assert_eq!(status.dirty_count, 0);
        assert!(status.last_sync_at.is_some());

        session.shutdown().await.unwrap();
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_user_preference_pauses_auto_save() {
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());

        let mut config = SyncConfig::new();
        config.sync.auto_save_interval_ms = 50;
        config.sync.auto_save_debounce_ms = 10;
        config.sync.auto_save_max_wait_ms = 20;

        let mut session = SyncSession::builder(config)
            .with_cache(cache.clone())
            .with_remote(Arc::new(InMemoryRemote::<Quotation>::new()))
            .with_editor(q.clone())
            .build()
            .unwrap();
        session.start().await.unwrap();

        session.set_user_auto_save(false).await;
        assert!(session.status().await.auto_save_paused);

        session.editor().unwrap().send_modify(|doc| doc.title = "paused edit".into());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get(&q.id).await.is_none());

        // Teardown still saves
        assert_eq!(session.on_teardown().await, SaveOutcome::Saved);
        assert!(cache.is_dirty(&q.id).await);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_hidden_flushes_and_pushes() {
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let remote = InMemoryRemote::<Quotation>::new();

        let mut session = SyncSession::builder(SyncConfig::new())
            .with_cache(EntityCache::new(PersistentStore::in_memory()))
            .with_remote(Arc::new(remote.clone()))
            .with_editor(q.clone())
            .build()
            .unwrap();
        session.start().await.unwrap();

        session.editor().unwrap().send_modify(|doc| doc.notes = Some("call back".into()));
        session.on_visibility_change(true).await;
        assert_eq!(remote.document(&q.id).unwrap().data.notes.as_deref(), Some("call back"));

        session.shutdown().await.unwrap();
    }

    fn fast_auto_save() -> SyncConfig {
        let mut config = SyncConfig::new();
        config.sync.auto_save_interval_ms = 50;
        config.sync.auto_save_debounce_ms = 10;
        config.sync.auto_save_max_wait_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_pulled_copy_survives_auto_save_ticks() {
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let remote = InMemoryRemote::<Quotation>::new();
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());
        cache.save_server_copy(&remote.seed(q.clone(), 1)).await;

        let mut session = SyncSession::builder(fast_auto_save())
            .with_cache(cache.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_editor(q.clone())
            .build()
            .unwrap();
        session.start().await.unwrap();
        let mut shown = session.editor().unwrap().subscribe();

        // A sibling pushes version 2
        let mut theirs = q.clone();
        theirs.title = "Sibling edit".into();
        remote.seed(theirs, 2);

        session.on_visibility_change(false).await;
        assert_eq!(cache.get(&q.id).await.unwrap().title, "Sibling edit");
        assert!(shown.has_changed().unwrap());
        assert_eq!(shown.borrow_and_update().title, "Sibling edit");

        // Several auto-save ticks later the adopted copy is still clean
        tokio::time::sleep(Duration::from_millis(300)).await;
        let cached = cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data.title, "Sibling edit");
        assert!(!cached.metadata.is_dirty);

        assert_eq!(session.save_now().await, PushOutcome::Clean);
        let server = remote.document(&q.id).unwrap();
        assert_eq!(server.version_number, 2);
        assert_eq!(server.data.title, "Sibling edit");

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_server_copy_survives_auto_save_ticks() {
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let remote = InMemoryRemote::<Quotation>::new();
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());
        cache.save_server_copy(&remote.seed(q.clone(), 1)).await;

        let mut session = SyncSession::builder(fast_auto_save())
            .with_cache(cache.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_editor(q.clone())
            .with_resolver(Arc::new(ResolutionStrategy::KeepServer))
            .build()
            .unwrap();
        session.start().await.unwrap();

        session.editor().unwrap().send_modify(|doc| doc.title = "Mine".into());
        session.on_teardown().await;
        assert!(cache.is_dirty(&q.id).await);

        let mut theirs = q.clone();
        theirs.title = "Theirs".into();
        remote.seed(theirs, 2);

        let report = session.sync_all().await;
        assert!(matches!(
            report.outcomes.get(&q.id),
            Some(PushOutcome::Resolved { strategy: ResolutionStrategy::KeepServer, version: 2 })
        ));
        assert_eq!(session.editor().unwrap().borrow().title, "Theirs");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let cached = cache.get_with_meta(&q.id).await.unwrap();
        assert_eq!(cached.data.title, "Theirs");
        assert!(!cached.metadata.is_dirty);

        assert_eq!(session.save_now().await, PushOutcome::Clean);
        let server = remote.document(&q.id).unwrap();
        assert_eq!(server.version_number, 2);
        assert_eq!(server.data.title, "Theirs");

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_keeps_unsaved_editor_changes() {
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let remote = InMemoryRemote::<Quotation>::new();
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());
        cache.save_server_copy(&remote.seed(q.clone(), 1)).await;

        // Timers far away: the edit below is only in memory when the pull runs
        let mut session = SyncSession::builder(SyncConfig::new())
            .with_cache(cache.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_editor(q.clone())
            .build()
            .unwrap();
        session.start().await.unwrap();

        session.editor().unwrap().send_modify(|doc| doc.title = "Typing".into());
        let mut theirs = q.clone();
        theirs.title = "Sibling edit".into();
        remote.seed(theirs, 2);

        let outcome = session.pull(&q.id).await;
        assert!(matches!(outcome, PullOutcome::LocalChangesPending(ref d) if d.title == "Typing"));
        assert_eq!(session.editor().unwrap().borrow().title, "Typing");
        assert!(cache.is_dirty(&q.id).await);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicts_reach_emitter() {
        let clock = ManualClock::default();
        let backend = MemoryBackend::new();
        let cache = cache_on(&backend, &clock);
        let remote = InMemoryRemote::<Quotation>::new();
        let emitter = Arc::new(RecordingEmitter::default());

        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        cache.save_server_copy(&remote.seed(q.clone(), 2)).await;
        let mut mine = q.clone();
        mine.title = "Mine".into();
        cache.save_dirty(&mine).await;
        remote.seed(q.clone(), 3);

        let session = SyncSession::builder(SyncConfig::new())
            .with_cache(cache)
            .with_remote(Arc::new(remote))
            .with_emitter(emitter.clone())
            .build()
            .unwrap();

        assert!(session.push(&q.id, None).await.is_conflict());
        let conflicts = emitter.conflicts.lock().unwrap().clone();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicting_fields, vec!["title".to_string()]);

        let outcome = session.push(&q.id, Some(&ResolutionStrategy::KeepServer)).await;
        assert!(outcome.is_success());
        assert_eq!(session.cache().get(&q.id).await.unwrap().title, "Kitchen");
    }

    #[tokio::test]
    async fn test_request_state_is_answered() {
        let clock = ManualClock::default();
        let backend = MemoryBackend::new();
        let channel = Arc::new(LocalChannel::new(64));
        let remote = InMemoryRemote::<Quotation>::new();

        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let cache = cache_on(&backend, &clock);
        cache.save_dirty(&q).await;

        let mut answering = SyncSession::builder(SyncConfig::new())
            .with_cache(cache)
            .with_remote(Arc::new(remote.clone()))
            .with_transport(channel.clone())
            .build()
            .unwrap();
        answering.start().await.unwrap();

        let asking = BroadcastBus::new(channel.clone());
        assert!(asking.init().await);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = asking.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });

        asking
            .publish(asking.event(BroadcastEventKind::RequestState, ALL_ENTITIES))
            .await;

        let answer = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(answer.kind, BroadcastEventKind::EntityUpdated);
        assert_eq!(answer.entity_id, q.id);
        assert_eq!(answer.origin_id, answering.bus().origin_id());

        answering.shutdown().await.unwrap();
        asking.close().await;
    }

    #[tokio::test]
    async fn test_long_outage_triggers_resync() {
        let clock = ManualClock::default();
        let backend = MemoryBackend::new();
        let cache = cache_on(&backend, &clock);
        let remote = InMemoryRemote::<Quotation>::new();
        let connectivity = ConnectivityMonitor::with_clock(true, Arc::new(clock.clone()));

        let mut session = SyncSession::builder(SyncConfig::new())
            .with_cache(cache.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_connectivity(connectivity.clone())
            .build()
            .unwrap();
        session.start().await.unwrap();

        connectivity.set_online(false);
        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        cache.save_dirty(&q).await;
        assert_eq!(session.push(&q.id, None).await, PushOutcome::Offline);

        clock.advance(chrono::Duration::minutes(10));
        connectivity.set_online(true);

        eventually(|| {
            let cache = cache.clone();
            let id = q.id.clone();
            async move { !cache.is_dirty(&id).await }
        })
        .await;
        assert_eq!(remote.document(&q.id).unwrap().version_number, 1);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sibling_sync_triggers_pull_of_clean_copy() {
        let clock = ManualClock::default();
        let channel = Arc::new(LocalChannel::new(64));
        let remote = InMemoryRemote::<Quotation>::new();
        let emitter = Arc::new(RecordingEmitter::default());

        // Separate stores: each session only sees the server
        let cache_a = cache_on(&MemoryBackend::new(), &clock);
        let cache_b = cache_on(&MemoryBackend::new(), &clock);

        let q = Quotation::new("Q-1", "Kitchen", "Acme");
        let seeded = remote.seed(q.clone(), 1);
        cache_a.save_server_copy(&seeded).await;
        cache_b.save_server_copy(&seeded).await;

        let mut a = SyncSession::builder(SyncConfig::new())
            .with_cache(cache_a.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_transport(channel.clone())
            .build()
            .unwrap();
        let mut b = SyncSession::builder(SyncConfig::new())
            .with_cache(cache_b.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_transport(channel.clone())
            .with_emitter(emitter.clone())
            .build()
            .unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let mut edited = q.clone();
        edited.title = "From A".into();
        cache_a.save_dirty(&edited).await;
        assert_eq!(a.push(&q.id, None).await, PushOutcome::Pushed { version: 2 });

        eventually(|| {
            let cache = cache_b.clone();
            let emitter = emitter.clone();
            let id = q.id.clone();
            async move {
                let pulled = cache.get(&id).await.map(|d| d.title) == Some("From A".to_string());
                pulled && !emitter.remote_changes.lock().unwrap().is_empty()
            }
        })
        .await;
        let changes = emitter.remote_changes.lock().unwrap().clone();
        assert_eq!(changes[0].kind, BroadcastEventKind::SyncCompleted);
        assert_eq!(changes[0].origin_id, a.bus().origin_id());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
