//! # Auto-save
//!
//! Bridges the in-memory document a UI edits to dirty writes in the entity
//! cache.
//!
//! ## Triggers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        AutoSaveScheduler loop                           │
//! │                                                                         │
//! │   watch::Receiver<T> ── change ──► debounce timer (reset per change,   │
//! │                                    capped by max-wait since the first) │
//! │                                           │                             │
//! │   interval tick ──────────────────────────┤  skipped while paused      │
//! │                                           │                             │
//! │   teardown / hidden / manual ─────────────┤  always run                 │
//! │                                           ▼                             │
//! │                                  edited since last write? ──► no-op     │
//! │                                           │                             │
//! │                                      AutoSaver::save                    │
//! │                                  JSON equal to last write? ──► no-op    │
//! │                                           │                             │
//! │                                  EntityCache::save_dirty                │
//! │                                  bus: entity_updated                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use quote_core::{BroadcastEventKind, SyncDocument};
use quote_store::EntityCache;

use crate::bus::BroadcastBus;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Saver
// =============================================================================

/// Result of one auto-save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to the cache as dirty.
    Saved,
    /// Equal to the last write; nothing done.
    Unchanged,
    /// The cache refused the write.
    Failed,
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Interval,
    Debounce,
    Teardown,
    Hidden,
    Manual,
}

impl FlushReason {
    /// Forced flushes run even while auto-save is paused.
    pub fn is_forced(&self) -> bool {
        matches!(self, FlushReason::Teardown | FlushReason::Hidden | FlushReason::Manual)
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Interval => write!(f, "interval"),
            FlushReason::Debounce => write!(f, "debounce"),
            FlushReason::Teardown => write!(f, "teardown"),
            FlushReason::Hidden => write!(f, "hidden"),
            FlushReason::Manual => write!(f, "manual"),
        }
    }
}

/// Writes a document to the cache as dirty unless it equals the last
/// value this saver wrote.
///
/// The saver also tracks whether the editor changed since the last write
/// or rebase. Timers consult that flag, so an editor still holding a copy
/// older than an adopted server document is never written back.
pub struct AutoSaver<T: SyncDocument> {
    cache: EntityCache<T>,
    bus: Option<BroadcastBus>,
    last_written: Mutex<Option<Value>>,
    edited: AtomicBool,
    saves: AtomicU64,
}

impl<T: SyncDocument> fmt::Debug for AutoSaver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoSaver")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("saves", &self.save_count())
            .finish()
    }
}

impl<T: SyncDocument> AutoSaver<T> {
    pub fn new(cache: EntityCache<T>) -> Self {
        AutoSaver {
            cache,
            bus: None,
            last_written: Mutex::new(None),
            edited: AtomicBool::new(true),
            saves: AtomicU64::new(0),
        }
    }

    /// Announces each write as `entity_updated` on `bus`.
    pub fn with_bus(mut self, bus: BroadcastBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Saves `doc` if it differs from the last write.
    pub async fn save(&self, doc: &T) -> SaveOutcome {
        let value = match serde_json::to_value(doc) {
            Ok(value) => value,
            Err(e) => {
                warn!(entity_id = %doc.id(), error = %e, "Auto-save could not encode document");
                return SaveOutcome::Failed;
            }
        };

        if self.last_written().as_ref() == Some(&value) {
            self.edited.store(false, Ordering::SeqCst);
            return SaveOutcome::Unchanged;
        }

        if !self.cache.save_dirty(doc).await {
            return SaveOutcome::Failed;
        }
        *self.last_written.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        self.edited.store(false, Ordering::SeqCst);
        self.saves.fetch_add(1, Ordering::Relaxed);

        if let Some(bus) = &self.bus {
            bus.publish(bus.event(BroadcastEventKind::EntityUpdated, doc.id()))
                .await;
        }
        SaveOutcome::Saved
    }

    /// Treats `doc` as already written, e.g. after adopting a server copy.
    pub fn rebase(&self, doc: &T) {
        let value = serde_json::to_value(doc).ok();
        *self.last_written.lock().unwrap_or_else(|e| e.into_inner()) = value;
        self.edited.store(false, Ordering::SeqCst);
    }

    /// Records that the editor changed since the last write.
    pub fn mark_edited(&self) {
        self.edited.store(true, Ordering::SeqCst);
    }

    /// True while an editor change has not been written or rebased away.
    pub fn has_unsaved_edits(&self) -> bool {
        self.edited.load(Ordering::SeqCst)
    }

    /// Number of writes performed.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    fn last_written(&self) -> Option<Value> {
        self.last_written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Timer settings for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSaveTiming {
    pub interval: Duration,
    pub debounce: Duration,
    pub max_wait: Duration,
}

impl Default for AutoSaveTiming {
    fn default() -> Self {
        AutoSaveTiming {
            interval: Duration::from_millis(5000),
            debounce: Duration::from_millis(750),
            max_wait: Duration::from_millis(10_000),
        }
    }
}

enum Command {
    Flush(FlushReason, oneshot::Sender<SaveOutcome>),
    Pause,
    Resume,
    Shutdown,
}

/// Handle to a running [`AutoSaveScheduler`].
pub struct AutoSaveHandle<T: SyncDocument> {
    commands: mpsc::Sender<Command>,
    saver: Arc<AutoSaver<T>>,
    paused: Arc<AtomicBool>,
}

impl<T: SyncDocument> Clone for AutoSaveHandle<T> {
    fn clone(&self) -> Self {
        AutoSaveHandle {
            commands: self.commands.clone(),
            saver: self.saver.clone(),
            paused: self.paused.clone(),
        }
    }
}

impl<T: SyncDocument> AutoSaveHandle<T> {
    /// Saves now regardless of timers.
    pub async fn flush(&self, reason: FlushReason) -> SaveOutcome {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(reason, tx)).await.is_err() {
            return SaveOutcome::Failed;
        }
        rx.await.unwrap_or(SaveOutcome::Failed)
    }

    /// The process is about to be torn down.
    pub async fn on_teardown(&self) -> SaveOutcome {
        self.flush(FlushReason::Teardown).await
    }

    /// The process became hidden.
    pub async fn on_hidden(&self) -> SaveOutcome {
        self.flush(FlushReason::Hidden).await
    }

    /// Stops timer-driven saves. Forced flushes still run.
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Pause).await;
    }

    /// Restarts timer-driven saves.
    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Resume).await;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Treats `doc` as already written.
    pub fn rebase(&self, doc: &T) {
        self.saver.rebase(doc);
    }

    pub fn saver(&self) -> &Arc<AutoSaver<T>> {
        &self.saver
    }

    /// Stops the scheduler.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelError("Auto-save scheduler already stopped".into()))
    }
}

/// Background loop driving an [`AutoSaver`] from timers and forced
/// triggers.
pub struct AutoSaveScheduler<T: SyncDocument> {
    saver: Arc<AutoSaver<T>>,
    source: watch::Receiver<T>,
    timing: AutoSaveTiming,
    commands: mpsc::Receiver<Command>,
    paused: Arc<AtomicBool>,
}

impl<T: SyncDocument> AutoSaveScheduler<T> {
    /// Spawns the scheduler watching `source`.
    pub fn spawn(
        saver: Arc<AutoSaver<T>>,
        source: watch::Receiver<T>,
        timing: AutoSaveTiming,
        paused: bool,
    ) -> AutoSaveHandle<T> {
        let (tx, rx) = mpsc::channel(16);
        let paused = Arc::new(AtomicBool::new(paused));

        let scheduler = AutoSaveScheduler {
            saver: saver.clone(),
            source,
            timing,
            commands: rx,
            paused: paused.clone(),
        };
        tokio::spawn(scheduler.run());

        AutoSaveHandle {
            commands: tx,
            saver,
            paused,
        }
    }

    async fn run(mut self) {
        info!(
            interval_ms = self.timing.interval.as_millis() as u64,
            debounce_ms = self.timing.debounce.as_millis() as u64,
            paused = self.paused.load(Ordering::SeqCst),
            "Auto-save scheduler starting"
        );

        let mut interval = tokio::time::interval_at(Instant::now() + self.timing.interval, self.timing.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut source_open = true;
        let mut first_change: Option<Instant> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let paused = self.paused.load(Ordering::SeqCst);

            tokio::select! {
                _ = interval.tick(), if !paused => {
                    self.flush(FlushReason::Interval).await;
                    first_change = None;
                    deadline = None;
                }

                changed = self.source.changed(), if source_open => {
                    if changed.is_err() {
                        // The editor is gone; keep what it last held
                        source_open = false;
                        self.saver.mark_edited();
                        self.flush(FlushReason::Teardown).await;
                        break;
                    }
                    self.saver.mark_edited();
                    if !self.paused.load(Ordering::SeqCst) {
                        let now = Instant::now();
                        let first = *first_change.get_or_insert(now);
                        deadline = Some((now + self.timing.debounce).min(first + self.timing.max_wait));
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !paused => {
                    self.flush(FlushReason::Debounce).await;
                    first_change = None;
                    deadline = None;
                }

                command = self.commands.recv() => match command {
                    Some(Command::Flush(reason, reply)) => {
                        let outcome = if reason.is_forced() || !self.paused.load(Ordering::SeqCst) {
                            self.flush(reason).await
                        } else {
                            SaveOutcome::Unchanged
                        };
                        first_change = None;
                        deadline = None;
                        let _ = reply.send(outcome);
                    }
                    Some(Command::Pause) => {
                        first_change = None;
                        deadline = None;
                        debug!("Auto-save paused");
                    }
                    Some(Command::Resume) => {
                        interval.reset();
                        debug!("Auto-save resumed");
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        info!(saves = self.saver.save_count(), "Auto-save scheduler stopped");
    }

    async fn flush(&mut self, reason: FlushReason) -> SaveOutcome {
        // A change the loop has not polled yet still counts
        if self.source.has_changed().unwrap_or(false) {
            self.saver.mark_edited();
        }
        let doc = self.source.borrow_and_update().clone();
        if !self.saver.has_unsaved_edits() {
            return SaveOutcome::Unchanged;
        }
        let outcome = self.saver.save(&doc).await;
        if outcome == SaveOutcome::Saved {
            debug!(entity_id = %doc.id(), %reason, "Auto-saved");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote_core::{LineItem, Quotation, SyncStatus};
    use quote_store::PersistentStore;

    fn setup() -> (EntityCache<Quotation>, Arc<AutoSaver<Quotation>>, Quotation) {
        let cache = EntityCache::<Quotation>::new(PersistentStore::in_memory());
        let saver = Arc::new(AutoSaver::new(cache.clone()));
        (cache, saver, Quotation::new("Q-7", "Roof repair", "Acme"))
    }

    fn timing() -> AutoSaveTiming {
        AutoSaveTiming {
            interval: Duration::from_secs(60),
            debounce: Duration::from_millis(750),
            max_wait: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_saver_skips_unchanged() {
        let (cache, saver, q) = setup();

        assert_eq!(saver.save(&q).await, SaveOutcome::Saved);
        assert_eq!(saver.save(&q).await, SaveOutcome::Unchanged);
        assert_eq!(saver.save_count(), 1);
        assert_eq!(cache.get_sync_status(&q.id).await, Some(SyncStatus::Pending));

        let mut edited = q.clone();
        edited.line_items.push(LineItem::new("Tiles", 40, 1250));
        assert_eq!(saver.save(&edited).await, SaveOutcome::Saved);
        assert_eq!(cache.get(&q.id).await.unwrap(), edited);
    }

    #[tokio::test]
    async fn test_rebase_suppresses_write() {
        let (cache, saver, q) = setup();
        saver.rebase(&q);
        assert_eq!(saver.save(&q).await, SaveOutcome::Unchanged);
        assert!(cache.get(&q.id).await.is_none());
    }

    #[tokio::test]
    async fn test_saver_keeps_unfinished_draft() {
        let (cache, saver, mut q) = setup();
        q.currency = "dollars".into();
        q.line_items.push(LineItem::new("", 0, 0));

        assert_eq!(saver.save(&q).await, SaveOutcome::Saved);
        assert_eq!(saver.save_count(), 1);
        assert!(cache.is_dirty(&q.id).await);
        assert_eq!(cache.get(&q.id).await.unwrap(), q);
    }

    #[tokio::test]
    async fn test_edit_tracking() {
        let (_cache, saver, q) = setup();
        assert!(saver.has_unsaved_edits());

        saver.save(&q).await;
        assert!(!saver.has_unsaved_edits());

        saver.mark_edited();
        saver.rebase(&q);
        assert!(!saver.has_unsaved_edits());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_never_rewrites_stale_editor_over_adopted_copy() {
        let (cache, saver, q) = setup();
        let (_tx, rx) = watch::channel(q.clone());
        let timing = AutoSaveTiming {
            interval: Duration::from_secs(5),
            debounce: Duration::from_millis(750),
            max_wait: Duration::from_secs(2),
        };
        let handle = AutoSaveScheduler::spawn(saver.clone(), rx, timing, false);

        // The first tick writes what the editor started with
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(saver.save_count(), 1);

        // A sibling's copy is adopted while the editor still shows the old one
        let mut adopted = q.clone();
        adopted.title = "Sibling edit".into();
        assert!(cache.save(&adopted).await);
        handle.rebase(&adopted);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(saver.save_count(), 1);
        assert_eq!(cache.get(&q.id).await.unwrap().title, "Sibling edit");
        assert!(!cache.is_dirty(&q.id).await);
        assert_eq!(handle.on_hidden().await, SaveOutcome::Unchanged);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_edits() {
        let (cache, saver, q) = setup();
        let (tx, rx) = watch::channel(q.clone());
        let handle = AutoSaveScheduler::spawn(saver.clone(), rx, timing(), false);

        for title in ["A", "AB", "ABC"] {
            tx.send_modify(|doc| doc.title = title.into());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(saver.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(saver.save_count(), 1);
        assert_eq!(cache.get(&q.id).await.unwrap().title, "ABC");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_forces_progress() {
        let (_cache, saver, q) = setup();
        let (tx, rx) = watch::channel(q);
        let handle = AutoSaveScheduler::spawn(saver.clone(), rx, timing(), false);

        // An edit every 500ms never lets the 750ms debounce expire
        for i in 0..6 {
            tx.send_modify(|doc| doc.title = format!("draft {}", i));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(saver.save_count() >= 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_saves() {
        let (_cache, saver, q) = setup();
        let (tx, rx) = watch::channel(q);
        let timing = AutoSaveTiming {
            interval: Duration::from_secs(5),
            debounce: Duration::from_secs(30),
            max_wait: Duration::from_secs(30),
        };
        let handle = AutoSaveScheduler::spawn(saver.clone(), rx, timing, false);

        tx.send_modify(|doc| doc.title = "edited".into());
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(saver.save_count(), 1);

        // Nothing changed since; the next tick is a no-op
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(saver.save_count(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_still_honors_forced_flushes() {
        let (cache, saver, q) = setup();
        let (tx, rx) = watch::channel(q.clone());
        let handle = AutoSaveScheduler::spawn(saver.clone(), rx, timing(), true);
        assert!(handle.is_paused());

        tx.send_modify(|doc| doc.title = "edited".into());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(saver.save_count(), 0);

        assert_eq!(handle.on_hidden().await, SaveOutcome::Saved);
        assert_eq!(cache.get(&q.id).await.unwrap().title, "edited");

        tx.send_modify(|doc| doc.title = "edited again".into());
        assert_eq!(handle.on_teardown().await, SaveOutcome::Saved);
        assert_eq!(handle.on_teardown().await, SaveOutcome::Unchanged);

        handle.resume().await;
        assert!(!handle.is_paused());
        tx.send_modify(|doc| doc.title = "resumed".into());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&q.id).await.unwrap().title, "resumed");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_source_flushes_and_stops() {
        let (cache, saver, q) = setup();
        let (tx, rx) = watch::channel(q.clone());
        let handle = AutoSaveScheduler::spawn(saver.clone(), rx, timing(), true);

        tx.send_modify(|doc| doc.title = "last words".into());
        drop(tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.get(&q.id).await.unwrap().title, "last words");
        assert!(handle.shutdown().await.is_err());
    }
}
