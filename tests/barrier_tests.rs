mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thoth::prelude::*;

use common::{EventRecorder, setup_thoth, update_factory};

fn wait_for_waiting(waiting: impl Fn() -> usize, expected: usize) {
    for _ in 0..1_000 {
        if waiting() == expected {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("barrier never reached {} waiting parties", expected);
}

#[test]
fn test_only_one_commit_barrier_lets_first_through() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let recorder = EventRecorder::new();
    let config = thoth
        .transaction_config("only-one")
        .with_readonly(false)
        .with_permanent_listener(recorder.clone());
    let factory = thoth.transaction_factory(config).unwrap();
    let barrier = OnlyOneCommitBarrier::new();

    let mut first = factory.start();
    let mut second = factory.start();
    r.set(&mut first, 1).unwrap();
    r.set(&mut second, 2).unwrap();

    barrier.arrive(&mut first).unwrap();
    assert!(barrier.is_open());
    assert_eq!(first.status(), TransactionStatus::Committed);

    let result = barrier.arrive(&mut second);
    assert!(matches!(result, Err(ThothError::CommitBarrierOpen(_))));
    assert!(!result.unwrap_err().is_conflict());
    assert_eq!(second.status(), TransactionStatus::Aborted);
    // Only the first transaction was ever prepared.
    assert_eq!(recorder.count(LifecycleEvent::PrePrepare), 1);
    assert_eq!(r.atomic_get().unwrap(), 1);
}

#[test]
fn test_only_one_commit_barrier_stays_closed_after_failed_commit() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let factory = update_factory(&thoth, "only-one-retry");
    let barrier = OnlyOneCommitBarrier::new();

    let mut stale = factory.start();
    r.get(&mut stale).unwrap();
    r.set(&mut stale, 10).unwrap();
    factory.atomically(|tx| r.set(tx, 5)).unwrap();

    let result = barrier.arrive(&mut stale);
    assert!(matches!(&result, Err(err) if err.is_conflict()));
    assert!(!barrier.is_open());

    let mut fresh = factory.start();
    r.set(&mut fresh, 20).unwrap();
    barrier.arrive(&mut fresh).unwrap();
    assert!(barrier.is_open());
    assert_eq!(r.atomic_get().unwrap(), 20);
}

#[test]
fn test_count_down_barrier_commits_all_parties() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let parties = 3;
    let barrier = Arc::new(CountDownCommitBarrier::new(parties));
    let committed_task = Arc::new(AtomicBool::new(false));
    let flag = committed_task.clone();
    barrier
        .register_on_commit(move || flag.store(true, Ordering::SeqCst))
        .unwrap();

    let refs: Vec<TxnRef<i64>> = (0..parties).map(|_| thoth.new_ref(0i64)).collect();
    let handles: Vec<_> = refs
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, reference)| {
            let thoth = thoth.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let factory = update_factory(&thoth, "count-down");
                let mut tx = factory.start();
                reference.set(&mut tx, index as i64 + 1).unwrap();
                barrier.join_commit(&mut tx)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(barrier.is_committed());
    assert!(committed_task.load(Ordering::SeqCst));
    for (index, reference) in refs.iter().enumerate() {
        assert_eq!(reference.atomic_get().unwrap(), index as i64 + 1);
    }
}

#[test]
fn test_count_down_barrier_abort_releases_waiters() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let barrier = Arc::new(CountDownCommitBarrier::new(2));
    let aborted_task = Arc::new(AtomicBool::new(false));
    let flag = aborted_task.clone();
    barrier
        .register_on_abort(move || flag.store(true, Ordering::SeqCst))
        .unwrap();

    let waiter = {
        let thoth = thoth.clone();
        let barrier = barrier.clone();
        let r = r.clone();
        thread::spawn(move || {
            let factory = update_factory(&thoth, "aborted-party");
            let mut tx = factory.start();
            r.set(&mut tx, 1).unwrap();
            let result = barrier.join_commit(&mut tx);
            (result, tx.status())
        })
    };

    wait_for_waiting(|| barrier.number_waiting(), 1);
    barrier.abort().unwrap();
    // Aborting twice is fine; the outcome doesn't change.
    barrier.abort().unwrap();

    let (result, status) = waiter.join().unwrap();
    assert!(matches!(result, Err(ThothError::CommitBarrierAborted)));
    assert_eq!(status, TransactionStatus::Aborted);
    assert!(barrier.is_aborted());
    assert!(aborted_task.load(Ordering::SeqCst));
    assert_eq!(r.atomic_get().unwrap(), 0);

    // Late parties are turned away and aborted.
    let factory = update_factory(&thoth, "late-party");
    let mut late = factory.start();
    r.set(&mut late, 2).unwrap();
    assert!(matches!(
        barrier.join_commit(&mut late),
        Err(ThothError::CommitBarrierAborted)
    ));
    assert_eq!(late.status(), TransactionStatus::Aborted);
    assert!(barrier.register_on_commit(|| {}).is_err());
}

#[test]
fn test_count_down_barrier_timeout_aborts() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let barrier = CountDownCommitBarrier::new(2);
    let factory = update_factory(&thoth, "timeout-party");

    let mut tx = factory.start();
    r.set(&mut tx, 1).unwrap();
    let joined = barrier
        .try_join_commit(&mut tx, Duration::from_millis(20))
        .unwrap();
    assert!(!joined);
    assert!(barrier.is_aborted());
    assert_eq!(tx.status(), TransactionStatus::Aborted);
    assert_eq!(r.atomic_get().unwrap(), 0);

    // The write lock taken by prepare was released.
    factory.atomically(|tx| r.set(tx, 3)).unwrap();
    assert_eq!(r.atomic_get().unwrap(), 3);
}

#[test]
fn test_count_down_barrier_prepare_failure_aborts_barrier() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let barrier = CountDownCommitBarrier::new(2);
    let factory = update_factory(&thoth, "failing-party");

    let mut stale = factory.start();
    r.set(&mut stale, 1).unwrap();
    factory.atomically(|tx| r.set(tx, 2)).unwrap();

    let result = barrier.join_commit(&mut stale);
    assert!(matches!(result, Err(ThothError::WriteConflict { .. })));
    assert!(barrier.is_aborted());
}

#[test]
fn test_count_down_barrier_registration() {
    let empty = CountDownCommitBarrier::new(0);
    assert!(empty.is_committed());
    assert!(matches!(
        empty.register(),
        Err(ThothError::CommitBarrierOpen(_))
    ));

    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let barrier = CountDownCommitBarrier::new(1);
    barrier.register().unwrap();
    assert_eq!(barrier.parties(), 2);

    let factory = update_factory(&thoth, "registered");
    let mut tx = factory.start();
    r.set(&mut tx, 1).unwrap();
    // Still one party short.
    assert!(!barrier
        .try_join_commit(&mut tx, Duration::from_millis(10))
        .unwrap());
}

#[test]
fn test_veto_barrier_commits_everyone() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let a = thoth.new_ref(0i64);
    let b = thoth.new_ref(0i64);
    let barrier = Arc::new(VetoCommitBarrier::new());

    let joiner = {
        let thoth = thoth.clone();
        let barrier = barrier.clone();
        let a = a.clone();
        thread::spawn(move || {
            let factory = update_factory(&thoth, "veto-joiner");
            let mut tx = factory.start();
            a.set(&mut tx, 1).unwrap();
            barrier.join_commit(&mut tx)
        })
    };

    wait_for_waiting(|| barrier.number_waiting(), 1);
    assert_eq!(a.atomic_get().unwrap(), 0);

    let factory = update_factory(&thoth, "veto-commit");
    let mut tx = factory.start();
    b.set(&mut tx, 2).unwrap();
    barrier.veto_commit(&mut tx).unwrap();

    joiner.join().unwrap().unwrap();
    assert_eq!(barrier.status(), BarrierStatus::Committed);
    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
}
