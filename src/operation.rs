use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One-shot completion flag shared by every path that may finish an operation.
///
/// The compare-and-set on this flag is the single synchronization point that
/// makes "exactly once" hold under arbitrary concurrent callers: whichever of
/// {an explicit `try_complete` caller, the timer's expiration path} transitions
/// the flag first runs the corresponding hook; every loser observes `false`
/// and must do nothing further.
#[derive(Debug, Default)]
pub struct CompletionFlag {
    completed: AtomicBool,
}

impl CompletionFlag {
    pub fn new() -> Self {
        Self {
            completed: AtomicBool::new(false),
        }
    }

    /// Attempts the PENDING -> COMPLETED transition.
    ///
    /// # Returns
    /// `true` only to the single caller that wins the transition.
    pub fn try_set(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Non-blocking snapshot read of the flag.
    pub fn is_set(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// A unit of deferred work with a completion predicate, a deadline, and
/// one-shot completion side effects.
///
/// Implementations provide the business logic ("can I complete now", "what
/// happens when I complete", "what happens if I expire"); the provided methods
/// carry the one-shot state machine. `try_complete` must be safe to call
/// redundantly: an idempotent no-op once the operation is completed.
///
/// Hooks run after the flag transition, so a panicking hook still leaves the
/// operation completed; the panic surfaces on whichever thread triggered
/// completion and the next sweep removes the entry from its watch lists.
pub trait DelayedOperation: Send + Sync {
    /// How long the operation may stay pending before it is forced through
    /// the expiration path.
    fn delay(&self) -> Duration;

    /// The shared one-shot flag. Implementations embed a `CompletionFlag`
    /// and return a reference to it here.
    fn completion(&self) -> &CompletionFlag;

    /// Checks whether the operation's condition now holds and, if so, must
    /// itself invoke `force_complete` and return its result.
    ///
    /// # Returns
    /// `true` if this call completed the operation, `false` otherwise
    /// (with no side effects).
    fn try_complete(&self) -> bool;

    /// Completion hook, invoked exactly once by the winner of the normal
    /// completion path.
    fn on_complete(&self);

    /// Expiration hook, invoked exactly once when the deadline elapsed and
    /// the expiration path won the race. Never invoked if normal completion
    /// already won; `on_complete` and `on_expiration` are mutually exclusive
    /// and exhaustive.
    fn on_expiration(&self);

    /// Non-blocking snapshot of the completion flag.
    fn is_completed(&self) -> bool {
        self.completion().is_set()
    }

    /// Transitions the operation to COMPLETED through the normal path.
    ///
    /// # Returns
    /// `true` only to the thread that wins the race; that thread (and no
    /// other) has already run `on_complete` by the time this returns.
    fn force_complete(&self) -> bool {
        if self.completion().try_set() {
            self.on_complete();
            return true;
        }
        false
    }

    /// Transitions the operation to COMPLETED through the expiration path.
    /// A no-op returning `false` when normal completion already won.
    fn expire(&self) -> bool {
        if self.completion().try_set() {
            self.on_expiration();
            return true;
        }
        false
    }
}
