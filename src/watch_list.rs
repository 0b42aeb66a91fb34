use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::operation::DelayedOperation;

/// Set of operations currently registered under one watch key.
///
/// All mutation and iteration of one list is mutually exclusive with itself;
/// independent lists are operated on concurrently with no contention. An
/// operation completed by some other path (another key's sweep, the timer's
/// expiration) may transiently remain here until the next sweep — lazy
/// cleanup is intentional.
pub struct WatchList {
    operations: Mutex<VecDeque<Arc<dyn DelayedOperation>>>,
}

impl WatchList {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends an operation to this key's collection. The registration
    /// protocol guarantees each operation is watched at most once per key,
    /// so no uniqueness check is performed here.
    pub fn watch(&self, op: Arc<dyn DelayedOperation>) {
        self.operations.lock().push_back(op);
    }

    /// Attempts completion of every still-pending entry.
    ///
    /// Entries already completed by a racing thread or by expiration are
    /// removed without invoking anything further; pending entries have their
    /// `try_complete` called and are removed if it succeeds.
    ///
    /// # Returns
    /// The count of operations completed during this call.
    pub fn try_complete_watched(&self) -> usize {
        let mut completed = 0;
        let mut ops = self.operations.lock();

        let mut i = 0;
        while i < ops.len() {
            if ops[i].is_completed() {
                ops.remove(i);
            } else if ops[i].try_complete() {
                completed += 1;
                ops.remove(i);
            } else {
                i += 1;
            }
        }

        if completed > 0 {
            trace!("Completed {} watched operations", completed);
        }
        completed
    }

    /// Removes entries already completed by some other path, never calling
    /// `try_complete`. Used by the periodic sweep to reclaim memory from
    /// operations that finished while still registered under other keys.
    ///
    /// # Returns
    /// The count of entries removed.
    pub fn purge_completed(&self) -> usize {
        let mut ops = self.operations.lock();
        let before = ops.len();
        ops.retain(|op| !op.is_completed());
        before - ops.len()
    }

    /// Number of entries currently in the list, completed ones included.
    pub fn watched(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }
}

impl Default for WatchList {
    fn default() -> Self {
        Self::new()
    }
}
