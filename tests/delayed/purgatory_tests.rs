use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;
use rand::Rng;

use purgatory::operation::DelayedOperation;
use purgatory::registry::DelayedOperationPurgatory;
use purgatory::timer::DelayQueueTimer;

use crate::common::{init_test_logger, SwitchOperation};

struct TestContext {
    purgatory: Arc<DelayedOperationPurgatory<String>>,
}

impl TestContext {
    fn new(test_name: &str, purge_interval: usize) -> Self {
        init_test_logger();
        let timer = Arc::new(DelayQueueTimer::new());
        let purgatory =
            DelayedOperationPurgatory::with_purge_interval(test_name, timer, purge_interval);
        Self { purgatory }
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.purgatory.shutdown();
    }
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn completion_and_expiration_are_exclusive_and_exhaustive() {
    let ctx = TestContext::new("exclusive_exhaustive", 50);
    let purgatory = &ctx.purgatory;

    const NUM_OPS: usize = 200;
    let key_pool: Vec<String> = (0..16).map(|i| format!("key-{}", i)).collect();
    let mut rng = rand::thread_rng();

    let mut ops = Vec::with_capacity(NUM_OPS);
    for _ in 0..NUM_OPS {
        let op = SwitchOperation::new(Duration::from_millis(rng.gen_range(10..60)));
        let first = rng.gen_range(0..key_pool.len());
        let second = (first + 1 + rng.gen_range(0..key_pool.len() - 1)) % key_pool.len();
        let keys = vec![key_pool[first].clone(), key_pool[second].clone()];
        assert!(!purgatory.try_complete_else_watch(op.clone(), &keys).unwrap());
        ops.push(op);
    }

    // Half the operations become completable; triggering threads hammer the
    // keys while another thread drives the clock past every deadline.
    for op in ops.iter().step_by(2) {
        op.make_completable();
    }

    let mut handles = Vec::new();
    for t in 0..4 {
        let purgatory = Arc::clone(purgatory);
        let keys = key_pool.clone();
        handles.push(thread::spawn(move || {
            let mut completed = 0;
            for round in 0..50 {
                let key = &keys[(t * 7 + round) % keys.len()];
                completed += purgatory.check_and_complete(key);
            }
            completed
        }));
    }
    {
        let purgatory = Arc::clone(purgatory);
        handles.push(thread::spawn(move || {
            for _ in 0..10 {
                purgatory.advance_clock(Duration::from_millis(10));
                thread::sleep(Duration::from_millis(1));
            }
            0
        }));
    }

    let triggered: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    info!("check_and_complete threads unblocked {} operations", triggered);

    for (i, op) in ops.iter().enumerate() {
        let hooks = op.completions() + op.expirations();
        assert_eq!(hooks, 1, "operation {} must finish exactly once", i);
        if i % 2 == 1 {
            // Never made completable: expiration is its only way out.
            assert_eq!(op.expirations(), 1, "operation {} must expire", i);
        }
    }
}

#[test]
fn operation_completed_by_trigger_never_expires() {
    let ctx = TestContext::new("trigger_beats_deadline", 10);
    let purgatory = &ctx.purgatory;

    let op = SwitchOperation::new(Duration::from_millis(50));
    let key = "p1".to_string();
    assert!(!purgatory
        .try_complete_else_watch(op.clone(), std::slice::from_ref(&key))
        .unwrap());

    op.make_completable();
    assert_eq!(purgatory.check_and_complete(&key), 1);
    assert_eq!(op.completions(), 1);

    // Wall-clock time far past the deadline must not re-fire the operation.
    purgatory.advance_clock(Duration::from_millis(500));
    assert_eq!(op.completions(), 1);
    assert_eq!(op.expirations(), 0);
}

#[test]
fn reaper_drives_expiration_and_purge() {
    let ctx = TestContext::new("reaper_end_to_end", 0);
    let purgatory = &ctx.purgatory;

    let mut ops = Vec::new();
    for i in 0..10 {
        let op = SwitchOperation::new(Duration::from_millis(30));
        let keys = vec![format!("own-{}", i), "shared".to_string()];
        assert!(!purgatory.try_complete_else_watch(op.clone(), &keys).unwrap());
        ops.push(op);
    }
    assert_eq!(purgatory.watched(), 20);

    purgatory.start_reaper_with_interval(Duration::from_millis(10));

    assert!(
        wait_until(
            || ops.iter().all(|op| op.expirations() == 1),
            Duration::from_secs(5)
        ),
        "every operation must expire"
    );

    // Purge cadence is a liveness property: the lingering entries are
    // eventually reclaimed, not necessarily on the first tick.
    assert!(
        wait_until(|| purgatory.watched() == 0, Duration::from_secs(5)),
        "watch lists must eventually be reclaimed"
    );
    assert_eq!(purgatory.num_delayed(), 0);
}

#[test]
fn shutdown_stops_reaper_and_timer() {
    let ctx = TestContext::new("shutdown_ordering", 10);
    let purgatory = &ctx.purgatory;

    let op = SwitchOperation::new(Duration::from_millis(5000));
    assert!(!purgatory
        .try_complete_else_watch(op.clone(), &["k".to_string()])
        .unwrap());
    purgatory.start_reaper_with_interval(Duration::from_millis(10));

    purgatory.shutdown();
    assert_eq!(purgatory.num_delayed(), 0, "timer must be drained");
    assert!(
        !op.is_completed(),
        "shutdown must not fire expirations for unexpired operations"
    );
}
