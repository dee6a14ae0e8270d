//! # Broadcast Bus
//!
//! Best-effort publish/subscribe between processes attached to the same
//! session.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Broadcast Bus                                  │
//! │                                                                         │
//! │   Process A                                  Process B                  │
//! │  ┌────────────────────┐                     ┌────────────────────┐     │
//! │  │ BroadcastBus       │                     │ BroadcastBus       │     │
//! │  │ origin_id = 3f1c.. │                     │ origin_id = 9a07.. │     │
//! │  │                    │   publish(event)    │                    │     │
//! │  │  publish ──────────┼──► BusTransport ────┼──► pump task       │     │
//! │  │                    │   (local channel    │     │ drop own     │     │
//! │  │  pump task ◄───────┼──── or WS relay) ◄──┼──── │ origin       │     │
//! │  │   │                │                     │     ▼              │     │
//! │  │   ▼                │                     │  subscribers       │     │
//! │  │  subscribers       │                     │  (all / entity)    │     │
//! │  └────────────────────┘                     └────────────────────┘     │
//! │                                                                         │
//! │  DELIVERY: at-most-once, unordered across processes. Consumers treat  │
//! │  events as hints to re-read state, never as deltas to apply.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transports
//! - [`LocalChannel`] - tokio broadcast channel shared by buses in one binary
//! - [`RelayTransport`] - WebSocket client of a [`RelayServer`]

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quote_core::{BroadcastEvent, BroadcastEventKind, Clock, SystemClock};

use crate::error::SyncResult;

pub mod local;
pub mod relay;

pub use local::LocalChannel;
pub use relay::{RelayConfig, RelayServer, RelayServerHandle, RelayTransport};

// =============================================================================
// Transport Trait
// =============================================================================

/// Moves events between the buses of one session.
///
/// A transport may echo a sender's own events back to it; the bus filters
/// them by origin.
#[async_trait]
pub trait BusTransport: Send + Sync + fmt::Debug {
    /// Opens the transport and returns a receiver of incoming events.
    async fn open(&self) -> SyncResult<broadcast::Receiver<BroadcastEvent>>;

    /// Sends an event to the other buses.
    async fn send(&self, event: &BroadcastEvent) -> SyncResult<()>;

    /// Releases the transport.
    async fn close(&self) {}
}

// =============================================================================
// Subscribers
// =============================================================================

type Callback = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;

struct Subscriber {
    entity_id: Option<String>,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

impl Registry {
    fn matching(&self, event: &BroadcastEvent) -> Vec<Callback> {
        self.subscribers
            .values()
            .filter(|s| s.entity_id.as_deref().map_or(true, |id| id == event.entity_id))
            .map(|s| s.callback.clone())
            .collect()
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Stops delivery to this subscriber.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Broadcast Bus
// =============================================================================

/// Per-process endpoint of the broadcast bus. Clones share the same
/// origin id, subscribers and pump task.
#[derive(Clone)]
pub struct BroadcastBus {
    origin_id: Arc<str>,
    transport: Option<Arc<dyn BusTransport>>,
    registry: Arc<Mutex<Registry>>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastBus")
            .field("origin_id", &self.origin_id)
            .field("transport", &self.transport)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl BroadcastBus {
    /// Creates a bus over `transport` with a fresh random origin id.
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self::build(Some(transport))
    }

    /// Creates a bus with no transport. `init` reports false and
    /// `publish` does nothing.
    pub fn unavailable() -> Self {
        Self::build(None)
    }

    fn build(transport: Option<Arc<dyn BusTransport>>) -> Self {
        BroadcastBus {
            origin_id: Uuid::new_v4().to_string().into(),
            transport,
            registry: Arc::new(Mutex::new(Registry::default())),
            pump: Arc::new(Mutex::new(None)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamps event timestamps with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// This process's origin id.
    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// Returns true once `init` has succeeded and until `close`.
    pub fn is_ready(&self) -> bool {
        lock(&self.pump).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Opens the transport and starts delivering events.
    ///
    /// Returns false, without failing, if no transport is available.
    pub async fn init(&self) -> bool {
        if self.is_ready() {
            return true;
        }
        let Some(transport) = &self.transport else {
            info!("Broadcast bus unavailable; cross-process sync disabled");
            return false;
        };

        let rx = match transport.open().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Failed to open broadcast transport");
                return false;
            }
        };

        let handle = tokio::spawn(pump(rx, self.origin_id.clone(), Arc::downgrade(&self.registry)));
        if let Some(previous) = lock(&self.pump).replace(handle) {
            previous.abort();
        }

        info!(origin_id = %self.origin_id, "Broadcast bus ready");
        true
    }

    /// Builds an event stamped with this process's origin id and the
    /// current time.
    pub fn event(&self, kind: BroadcastEventKind, entity_id: impl Into<String>) -> BroadcastEvent {
        BroadcastEvent::new(kind, entity_id, &*self.origin_id, self.clock.now_ms())
    }

    /// Publishes an event. Returns false if it could not be handed to the
    /// transport.
    pub async fn publish(&self, event: BroadcastEvent) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        if !self.is_ready() {
            debug!(kind = ?event.kind, "Bus not ready; event dropped");
            return false;
        }

        match transport.send(&event).await {
            Ok(()) => {
                debug!(kind = ?event.kind, entity_id = %event.entity_id, "Event published");
                true
            }
            Err(e) => {
                warn!(kind = ?event.kind, error = %e, "Failed to publish event");
                false
            }
        }
    }

    /// Delivers every event from other processes to `callback`.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Delivers events about `entity_id` from other processes to `callback`.
    pub fn subscribe_to_entity<F>(&self, entity_id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.register(Some(entity_id.into()), Arc::new(callback))
    }

    fn register(&self, entity_id: Option<String>, callback: Callback) -> Subscription {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.insert(id, Subscriber { entity_id, callback });

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }

    /// Stops delivery and releases the transport.
    pub async fn close(&self) {
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            handle.abort();
            if let Some(transport) = &self.transport {
                transport.close().await;
            }
            info!(origin_id = %self.origin_id, "Broadcast bus closed");
        }
    }
}

/// Forwards incoming events to subscribers, dropping this process's own.
async fn pump(
    mut rx: broadcast::Receiver<BroadcastEvent>,
    origin_id: Arc<str>,
    registry: Weak<Mutex<Registry>>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Broadcast receiver lagged; events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if *event.origin_id == *origin_id {
            continue;
        }

        let Some(registry) = registry.upgrade() else {
            break;
        };
        // Callbacks run without the lock so they may (un)subscribe
        let callbacks = lock(&registry).matching(&event);
        drop(registry);

        for callback in callbacks {
            callback(&event);
        }
    }
    debug!("Broadcast pump stopped");
}
