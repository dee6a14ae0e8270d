//! In-process bus transport.

use async_trait::async_trait;
use tokio::sync::broadcast;

use quote_core::BroadcastEvent;

use super::BusTransport;
use crate::error::SyncResult;

/// Default buffered events per receiver.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out over a tokio broadcast channel.
///
/// Every bus opened on a clone of the same channel sees every event; this
/// stands in for separate processes in tests and single-binary setups.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        LocalChannel { tx }
    }

    /// Number of open receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl BusTransport for LocalChannel {
    async fn open(&self) -> SyncResult<broadcast::Receiver<BroadcastEvent>> {
        Ok(self.tx.subscribe())
    }

    async fn send(&self, event: &BroadcastEvent) -> SyncResult<()> {
        // No receivers is not an error for a best-effort bus
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
