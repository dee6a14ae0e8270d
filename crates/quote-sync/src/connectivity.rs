//! # Connectivity Monitor
//!
//! Tracks whether the process can reach the server.
//!
//! ```text
//!   runtime signal / health ping
//!             │ set_online(bool)
//!             ▼
//!   ┌──────────────────────────┐   snapshot()    ┌──────────────────┐
//!   │   ConnectivityMonitor    │◄────────────────│ SyncCoordinator  │
//!   │  online                  │                 │ (polls before    │
//!   │  last_online_at          │                 │  every request)  │
//!   │  last_offline_at         │                 └──────────────────┘
//!   └──────────────────────────┘
//!             │ watch::Receiver<bool>
//!             ▼
//!        SyncSession (re-sync after a long outage)
//! ```
//!
//! The coordinator never subscribes; it reads a snapshot. Only the session
//! watches for transitions.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use quote_core::{Clock, SystemClock};

/// Point-in-time view of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub online: bool,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct State {
    online: bool,
    last_online_at: Option<DateTime<Utc>>,
    last_offline_at: Option<DateTime<Utc>>,
    /// Length of the outage that ended most recently, until taken.
    pending_outage: Option<chrono::Duration>,
}

/// Shared online/offline state. Clones share the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<Mutex<State>>,
    changes: Arc<watch::Sender<bool>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &*self.lock())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Creates a monitor in the given initial state.
    pub fn new(online: bool) -> Self {
        Self::with_clock(online, Arc::new(SystemClock))
    }

    /// Creates a monitor that stamps transitions with `clock`.
    pub fn with_clock(online: bool, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let state = State {
            online,
            last_online_at: online.then_some(now),
            last_offline_at: (!online).then_some(now),
            pending_outage: None,
        };
        let (changes, _) = watch::channel(online);

        ConnectivityMonitor {
            state: Arc::new(Mutex::new(state)),
            changes: Arc::new(changes),
            clock,
        }
    }

    /// Feeds the runtime's connectivity signal. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.online == online {
            return false;
        }

        state.online = online;
        if online {
            state.last_online_at = Some(now);
            let outage = state.last_offline_at.map(|at| now - at);
            state.pending_outage = outage;
            info!(
                outage_ms = outage.map(|d| d.num_milliseconds()),
                "Connectivity restored"
            );
        } else {
            state.last_offline_at = Some(now);
            state.pending_outage = None;
            info!("Connectivity lost");
        }
        drop(state);

        self.changes.send_replace(online);
        true
    }

    /// Returns true if currently online.
    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Returns the current state.
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        let state = self.lock();
        ConnectivitySnapshot {
            online: state.online,
            last_online_at: state.last_online_at,
            last_offline_at: state.last_offline_at,
        }
    }

    /// How long the process has been offline, `None` while online.
    pub fn offline_for(&self) -> Option<chrono::Duration> {
        let state = self.lock();
        if state.online {
            return None;
        }
        state.last_offline_at.map(|at| self.clock.now() - at)
    }

    /// Reports, once per reconnect, whether the outage that just ended
    /// lasted at least `max_offline`.
    pub fn take_reconnect(&self, max_offline: Duration) -> bool {
        let Some(outage) = self.lock().pending_outage.take() else {
            return false;
        };
        let threshold = chrono::Duration::from_std(max_offline).unwrap_or_else(|_| chrono::Duration::max_value());
        outage >= threshold
    }

    /// Watches online/offline transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.changes.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote_core::ManualClock;

    #[test]
    fn test_transitions_stamp_times() {
        let clock = ManualClock::default();
        let monitor = ConnectivityMonitor::with_clock(true, Arc::new(clock.clone()));
        let start = clock.now();

        assert!(!monitor.set_online(true), "no transition");
        clock.advance(chrono::Duration::seconds(10));
        assert!(monitor.set_online(false));

        let snap = monitor.snapshot();
        assert!(!snap.online);
        assert_eq!(snap.last_online_at, Some(start));
        assert_eq!(snap.last_offline_at, Some(start + chrono::Duration::seconds(10)));

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(monitor.offline_for(), Some(chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_take_reconnect_reports_long_outage_once() {
        let clock = ManualClock::default();
        let monitor = ConnectivityMonitor::with_clock(true, Arc::new(clock.clone()));

        monitor.set_online(false);
        clock.advance(chrono::Duration::minutes(6));
        monitor.set_online(true);

        assert!(monitor.take_reconnect(Duration::from_secs(300)));
        assert!(!monitor.take_reconnect(Duration::from_secs(300)));
    }

    #[test]
    fn test_short_outage_not_reported() {
        let clock = ManualClock::default();
        let monitor = ConnectivityMonitor::with_clock(true, Arc::new(clock.clone()));

        monitor.set_online(false);
        clock.advance(chrono::Duration::seconds(30));
        monitor.set_online(true);

        assert!(!monitor.take_reconnect(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
