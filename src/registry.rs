use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::common::config::{DEFAULT_PURGE_INTERVAL, REAPER_INTERVAL};
use crate::common::exception::PurgatoryError;
use crate::operation::DelayedOperation;
use crate::timer::TimeoutTimer;
use crate::watch_list::WatchList;

/// Registry owning all watch lists for one family of delayed operations.
///
/// A caller registers an operation under one or more watch keys with
/// `try_complete_else_watch`; any thread holding a key later calls
/// `check_and_complete` after mutating whatever condition the operation's
/// `try_complete` inspects. Operations that never become completable are
/// forced through their expiration path by the timer, which the background
/// reaper advances on a fixed period.
///
/// The key->list map takes its read mode for lookups and registrations and
/// its write mode only for the rare structural changes (create-on-first-use,
/// remove-when-empty), keeping the hot path concurrent across unrelated keys.
pub struct DelayedOperationPurgatory<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    name: String,
    watch_lists: RwLock<HashMap<K, Arc<WatchList>>>,
    timer: Arc<dyn TimeoutTimer>,
    purge_interval: usize,
    /// Overestimates the true pending count between purge cycles; reset to
    /// the timer's pending count at every purge.
    estimated_total_operations: AtomicUsize,
    shut_down: AtomicBool,
    reaper_shutdown: Mutex<Option<Sender<()>>>,
    reaper_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<K> DelayedOperationPurgatory<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Creates a purgatory with the default purge interval.
    ///
    /// # Parameters
    /// - `name`: Human-readable name used in log lines.
    /// - `timer`: The timeout-tracking collaborator.
    pub fn new(name: &str, timer: Arc<dyn TimeoutTimer>) -> Arc<Self> {
        Self::with_purge_interval(name, timer, DEFAULT_PURGE_INTERVAL)
    }

    /// Creates a purgatory that sweeps its watch lists once the gap between
    /// registered and timer-pending operations exceeds `purge_interval`.
    pub fn with_purge_interval(
        name: &str,
        timer: Arc<dyn TimeoutTimer>,
        purge_interval: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            watch_lists: RwLock::new(HashMap::new()),
            timer,
            purge_interval,
            estimated_total_operations: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            reaper_shutdown: Mutex::new(None),
            reaper_thread: Mutex::new(None),
        })
    }

    /// Checks whether the operation can complete now and, if not, registers
    /// it under every watch key and with the timer.
    ///
    /// # Parameters
    /// - `op`: The operation; `keys` must be non-empty.
    ///
    /// # Returns
    /// `Ok(true)` if this call completed the operation; `Ok(false)` if the
    /// operation was left pending (or is already finishing via some other
    /// path) — the caller must not invoke its completion side effects itself.
    ///
    /// # Errors
    /// `PurgatoryError::NoWatchKeys` for an empty key set (a caller bug),
    /// `PurgatoryError::ShutDown` after shutdown.
    pub fn try_complete_else_watch(
        &self,
        op: Arc<dyn DelayedOperation>,
        keys: &[K],
    ) -> Result<bool, PurgatoryError> {
        if keys.is_empty() {
            return Err(PurgatoryError::NoWatchKeys);
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PurgatoryError::ShutDown(self.name.clone()));
        }

        // First attempt runs outside any per-key lock.
        if op.try_complete() {
            return Ok(true);
        }

        let mut watch_created = false;
        for key in keys {
            // Another path is already finishing this operation; registering
            // it on further lists would only create garbage for the sweep.
            if op.is_completed() {
                return Ok(false);
            }
            self.watch_for_operation(key, Arc::clone(&op));

            if !watch_created {
                watch_created = true;
                self.estimated_total_operations.fetch_add(1, Ordering::SeqCst);
            }
        }

        // Mandatory second check: a trigger may have fired between the first
        // attempt and the completion of the registrations above, and the
        // operation would otherwise sit un-woken on some keys forever.
        if op.try_complete() {
            return Ok(true);
        }

        if !op.is_completed() {
            self.timer.schedule(Arc::clone(&op), op.delay());
            if op.is_completed() {
                // Cancellation is best-effort: the timer drops completed
                // entries when their deadline pops.
                trace!(
                    "Operation in {} purgatory completed between scheduling and re-check",
                    self.name
                );
            }
        }

        Ok(false)
    }

    /// Attempts completion of every still-pending operation watched under
    /// `key`. External state-change events call this after mutating whatever
    /// condition the operations' `try_complete` inspects.
    ///
    /// # Returns
    /// The count of operations completed by this call; 0 if no list exists
    /// for the key.
    pub fn check_and_complete(&self, key: &K) -> usize {
        let list = self.watch_lists.read().get(key).cloned();
        let Some(list) = list else {
            return 0;
        };

        let completed = list.try_complete_watched();
        if completed > 0 {
            debug!(
                "Request key {:?} unblocked {} {} operations",
                key, completed, self.name
            );
        }
        if list.is_empty() {
            self.remove_key_if_empty(key, &list);
        }
        completed
    }

    /// Advances the timer, synchronously firing expirations, then purges
    /// every watch list if the approximate-total vs. pending-count gap has
    /// crossed the purge interval. The sweep only reclaims already-finished
    /// entries; it never affects which operations are logically pending.
    pub fn advance_clock(&self, delta: Duration) {
        self.timer.advance(delta);

        let num_delayed = self.timer.pending_count();
        let estimated = self.estimated_total_operations.load(Ordering::SeqCst);
        if estimated.saturating_sub(num_delayed) > self.purge_interval {
            // Correct the counter before the sweep so a concurrent purge
            // decision sees the reset value.
            self.estimated_total_operations
                .store(num_delayed, Ordering::SeqCst);
            debug!("Beginning purge of {} purgatory", self.name);

            let lists: Vec<(K, Arc<WatchList>)> = self
                .watch_lists
                .read()
                .iter()
                .map(|(key, list)| (key.clone(), Arc::clone(list)))
                .collect();

            let mut purged = 0;
            for (key, list) in &lists {
                purged += list.purge_completed();
                if list.is_empty() {
                    self.remove_key_if_empty(key, list);
                }
            }
            info!("Purged {} elements from {} purgatory", purged, self.name);
        }
    }

    /// Total entries across all watch lists, completed ones included until
    /// the next sweep removes them. Approximate by design.
    pub fn watched(&self) -> usize {
        self.watch_lists
            .read()
            .values()
            .map(|list| list.watched())
            .sum()
    }

    /// Count of operations still tracked by the timer.
    pub fn num_delayed(&self) -> usize {
        self.timer.pending_count()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the background reaper on the default period.
    pub fn start_reaper(self: &Arc<Self>) {
        self.start_reaper_with_interval(REAPER_INTERVAL);
    }

    /// Starts the background reaper, which advances the clock by the real
    /// elapsed time every `interval` for the lifetime of the purgatory.
    pub fn start_reaper_with_interval(self: &Arc<Self>, interval: Duration) {
        let mut reaper_thread = self.reaper_thread.lock();

        // Checked under the thread-handle lock: shutdown flips the flag
        // before taking this lock, so a racing shutdown either turns this
        // start into a no-op or joins the thread spawned below.
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Not starting reaper for shut-down purgatory {}", self.name);
            return;
        }
        if reaper_thread.is_some() {
            warn!("Reaper for purgatory {} already running", self.name);
            return;
        }

        let (tx, rx) = bounded::<()>(1);
        *self.reaper_shutdown.lock() = Some(tx);

        let purgatory = Arc::clone(self);
        *reaper_thread = Some(thread::spawn(move || {
            info!("Reaper for {} purgatory started", purgatory.name);
            let mut last_tick = Instant::now();

            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        let elapsed = now.duration_since(last_tick);
                        last_tick = now;
                        purgatory.advance_clock(elapsed);
                    }
                    // Shutdown signal, or the sender was dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            info!("Reaper for {} purgatory stopped", purgatory.name);
        }));
    }

    /// Stops the reaper, then shuts the timer down, in that order so no
    /// expiration fires against a timer mid-teardown. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down {} purgatory", self.name);

        // Same lock order as start_reaper_with_interval: thread handle first,
        // then the shutdown sender.
        let handle = self.reaper_thread.lock().take();
        if let Some(tx) = self.reaper_shutdown.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.join() {
                error!("Reaper thread for {} purgatory panicked: {:?}", self.name, e);
            }
        }

        self.timer.shutdown();
        info!("{} purgatory shut down", self.name);
    }

    /// Registers the operation under `key`, creating the list lazily.
    fn watch_for_operation(&self, key: &K, op: Arc<dyn DelayedOperation>) {
        {
            let lists = self.watch_lists.read();
            if let Some(list) = lists.get(key) {
                list.watch(op);
                return;
            }
        }

        // No list for the key; take the write lock and re-check, since
        // another registration may have created it in between.
        let mut lists = self.watch_lists.write();
        let list = lists
            .entry(key.clone())
            .or_insert_with(|| Arc::new(WatchList::new()));
        list.watch(op);
    }

    /// Removes `key` from the map only if it still maps to `list` and the
    /// list is still empty. The re-check under the write lock guards against
    /// a registration that raced in after the list reported empty; losing
    /// that race is a pure no-op.
    fn remove_key_if_empty(&self, key: &K, list: &Arc<WatchList>) {
        let mut lists = self.watch_lists.write();
        if let Some(current) = lists.get(key) {
            if Arc::ptr_eq(current, list) && list.is_empty() {
                lists.remove(key);
                trace!("Removed empty watch list for key {:?} in {}", key, self.name);
            }
        }
    }
}
