use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use purgatory::common::logger as core_logger;
use purgatory::operation::{CompletionFlag, DelayedOperation};

static INIT: Once = Once::new();

pub fn init_test_logger() {
    INIT.call_once(|| {
        // Prefer INFO level for CI noise; override via RUST_LOG when needed
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "info");
        }
        core_logger::initialize_logger();
    });
}

/// Operation whose completability is an externally flipped switch, with
/// counters for each hook.
pub struct SwitchOperation {
    flag: CompletionFlag,
    delay: Duration,
    completable: AtomicBool,
    completions: AtomicUsize,
    expirations: AtomicUsize,
}

impl SwitchOperation {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            flag: CompletionFlag::new(),
            delay,
            completable: AtomicBool::new(false),
            completions: AtomicUsize::new(0),
            expirations: AtomicUsize::new(0),
        })
    }

    pub fn make_completable(&self) {
        self.completable.store(true, Ordering::SeqCst);
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn expirations(&self) -> usize {
        self.expirations.load(Ordering::SeqCst)
    }
}

impl DelayedOperation for SwitchOperation {
    fn delay(&self) -> Duration {
        self.delay
    }

    fn completion(&self) -> &CompletionFlag {
        &self.flag
    }

    fn try_complete(&self) -> bool {
        if self.completable.load(Ordering::SeqCst) {
            return self.force_complete();
        }
        false
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::SeqCst);
    }
}
