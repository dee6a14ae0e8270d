//! Simulated editor processes sharing one physical store, one bus and one
//! server of record.

use std::sync::Arc;
use std::time::Duration;

use quote_core::{Clock, ManualClock, Quotation};
use quote_store::{EntityCache, MemoryBackend, PersistentStore, StorageBackend};
use quote_sync::{BroadcastBus, ConnectivityMonitor, InMemoryRemote, LocalChannel, RemoteDocuments, SyncCoordinator};

/// Everything the processes of one test share.
pub struct World {
    pub clock: ManualClock,
    pub backend: Arc<dyn StorageBackend>,
    pub channel: Arc<LocalChannel>,
    pub remote: InMemoryRemote<Quotation>,
}

impl World {
    pub fn new() -> Self {
        World {
            clock: ManualClock::default(),
            backend: Arc::new(MemoryBackend::new()),
            channel: Arc::new(LocalChannel::new(64)),
            remote: InMemoryRemote::new(),
        }
    }

    /// Starts a process against the shared pieces.
    pub async fn process(&self) -> Process {
        self.spawn(self.backend.clone(), Arc::new(self.remote.clone())).await
    }

    /// Starts a process with a store of its own, as on another machine.
    pub async fn isolated_process(&self) -> Process {
        self.spawn(Arc::new(MemoryBackend::new()), Arc::new(self.remote.clone()))
            .await
    }

    /// Starts a process on the shared store talking to `remote`.
    pub async fn process_with_remote(&self, remote: Arc<dyn RemoteDocuments<Quotation>>) -> Process {
        self.spawn(self.backend.clone(), remote).await
    }

    async fn spawn(&self, backend: Arc<dyn StorageBackend>, remote: Arc<dyn RemoteDocuments<Quotation>>) -> Process {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let store = PersistentStore::new(backend, "quote").with_clock(clock.clone());
        let cache = EntityCache::new(store);

        let bus = BroadcastBus::new(self.channel.clone()).with_clock(clock.clone());
        assert!(bus.init().await);

        let connectivity = ConnectivityMonitor::with_clock(true, clock);
        let coordinator = SyncCoordinator::new(cache.clone(), remote, connectivity.clone()).with_bus(bus.clone());

        Process {
            cache,
            bus,
            connectivity,
            coordinator,
        }
    }
}

/// One editor process.
pub struct Process {
    pub cache: EntityCache<Quotation>,
    pub bus: BroadcastBus,
    pub connectivity: ConnectivityMonitor,
    pub coordinator: SyncCoordinator<Quotation>,
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
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
    panic!("condition not reached within two seconds");
}
