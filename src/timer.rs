use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::config::DelayMs;
use crate::operation::DelayedOperation;

/// Timeout-tracking collaborator of the purgatory.
///
/// Advancing the clock past an operation's deadline forces it through its
/// expiration path exactly once; the operation's completion flag makes the
/// expiration a no-op if the operation already completed normally. The
/// representation behind this trait is not part of the core contract: a
/// deadline-ordered heap and a multi-level wheel are both valid.
pub trait TimeoutTimer: Send + Sync {
    /// Registers an operation for forced expiration after `delay`.
    fn schedule(&self, op: Arc<dyn DelayedOperation>, delay: Duration);

    /// Advances the timer's clock by `delta`, synchronously firing the
    /// expiration path of every operation whose deadline has passed.
    fn advance(&self, delta: Duration);

    /// Approximate count of scheduled operations not yet fired.
    fn pending_count(&self) -> usize;

    /// Drops all scheduled operations without firing them. Idempotent.
    fn shutdown(&self);
}

struct TimerEntry {
    deadline: DelayMs,
    // Tiebreaker so the heap never compares operations themselves and
    // equal deadlines pop in schedule order.
    seq: u64,
    op: Arc<dyn DelayedOperation>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Deadline-ordered timer over a virtual millisecond clock.
///
/// There is no eager cancellation: operations that complete normally stay in
/// the heap until their deadline pops, at which point the completed flag makes
/// them a silent drop. `pending_count` may therefore transiently overcount;
/// the purgatory's purge trigger tolerates that by design.
pub struct DelayQueueTimer {
    now_ms: AtomicU64,
    next_seq: AtomicU64,
    pending: AtomicUsize,
    queue: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
}

impl DelayQueueTimer {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            queue: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Current reading of the virtual clock, in milliseconds.
    pub fn now(&self) -> DelayMs {
        self.now_ms.load(Ordering::Acquire)
    }
}

impl Default for DelayQueueTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutTimer for DelayQueueTimer {
    fn schedule(&self, op: Arc<dyn DelayedOperation>, delay: Duration) {
        let deadline = self.now().saturating_add(delay.as_millis() as DelayMs);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        trace!("Scheduling operation for deadline {}ms (seq {})", deadline, seq);

        // Counted before the push: once the entry is in the heap a concurrent
        // advance may pop it and decrement, so the increment must already be
        // visible or the counter would transiently wrap.
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push(Reverse(TimerEntry { deadline, seq, op }));
    }

    fn advance(&self, delta: Duration) {
        let now = self
            .now_ms
            .fetch_add(delta.as_millis() as u64, Ordering::AcqRel)
            + delta.as_millis() as u64;

        loop {
            // Pop one due entry at a time so expiration hooks never run under
            // the heap lock; a hook may re-enter the purgatory and schedule or
            // complete other operations.
            let entry = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    Some(Reverse(entry)) if entry.deadline <= now => queue.pop(),
                    _ => None,
                }
            };

            let Some(Reverse(entry)) = entry else {
                break;
            };
            self.pending.fetch_sub(1, Ordering::SeqCst);

            if entry.op.is_completed() {
                // Completed through the normal path; the missed cancel is
                // harmless and the entry is dropped here.
                trace!("Dropping already-completed entry (deadline {}ms)", entry.deadline);
                continue;
            }

            if entry.op.expire() {
                debug!("Expired operation with deadline {}ms at clock {}ms", entry.deadline, now);
            }
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.pending.store(0, Ordering::SeqCst);
        if dropped > 0 {
            debug!("Timer shutdown dropped {} unexpired entries", dropped);
        }
    }
}
