// Declare the common module *within this test crate*
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::Rng;
use thoth::prelude::*;

use common::{is_conflict, setup_thoth, update_factory};

#[test]
fn test_reverse_order_writers_never_deadlock() {
    // T1 writes r1 then r2, T2 writes r2 then r1. Exactly one of them commits
    // and each reference is incremented exactly once.
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r1 = thoth.new_ref(0i64);
    let r2 = thoth.new_ref(0i64);
    let barrier = Arc::new(Barrier::new(2));

    let spawn_writer = |first: TxnRef<i64>, second: TxnRef<i64>| {
        let thoth = thoth.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            let factory = update_factory(&thoth, "reverse-order");
            let mut tx = factory.start();
            let opened = first
                .alter_and_get(&mut tx, |value| value + 1)
                .and_then(|_| second.alter_and_get(&mut tx, |value| value + 1))
                .map(|_| ());
            // Both have opened everything before either commits.
            barrier.wait();
            opened.and_then(|()| tx.commit())
        })
    };

    let t1 = spawn_writer(r1.clone(), r2.clone());
    let t2 = spawn_writer(r2.clone(), r1.clone());
    let results = [t1.join().unwrap(), t2.join().unwrap()];

    let committed = results.iter().filter(|result| result.is_ok()).count();
    let conflicted = results.iter().filter(|result| is_conflict(result)).count();
    assert_eq!(committed, 1, "results: {:?}", results);
    assert_eq!(conflicted, 1, "results: {:?}", results);
    assert_eq!(r1.atomic_get().unwrap(), 1);
    assert_eq!(r2.atomic_get().unwrap(), 1);
    assert_eq!(r1.version(), 2);
    assert_eq!(r2.version(), 2);
}

#[test]
fn test_tracked_read_conflicts_with_later_commit() {
    // T only reads r; a commit to r before T commits makes T fail.
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let other = thoth.new_ref(0i64);
    let barrier = Arc::new(Barrier::new(2));

    let reader = {
        let thoth = thoth.clone();
        let barrier = barrier.clone();
        let r = r.clone();
        thread::spawn(move || {
            let config = thoth
                .transaction_config("tracked-reader")
                .with_readonly(true)
                .with_track_reads(true);
            let factory = thoth.transaction_factory(config).unwrap();
            let mut tx = factory.start();
            assert_eq!(r.get(&mut tx).unwrap(), 0);
            barrier.wait(); // writer may commit
            barrier.wait(); // writer committed
            tx.commit()
        })
    };

    let writer = {
        let thoth = thoth.clone();
        let barrier = barrier.clone();
        let r = r.clone();
        thread::spawn(move || {
            barrier.wait();
            let factory = update_factory(&thoth, "writer");
            factory.atomically(|tx| r.set(tx, 1)).unwrap();
            barrier.wait();
        })
    };

    writer.join().unwrap();
    let result = reader.join().unwrap();
    assert!(
        matches!(result, Err(ThothError::ReadWriteConflict { ref_id, .. }) if ref_id == r.id()),
        "unexpected result: {:?}",
        result
    );
    assert_eq!(r.atomic_get().unwrap(), 1);
    assert_eq!(other.version(), 1);
}

#[test]
fn test_stale_read_detected_on_next_open() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let a = thoth.new_ref(0i64);
    let b = thoth.new_ref(0i64);
    let reader_factory = update_factory(&thoth, "reader");
    let writer_factory = update_factory(&thoth, "writer");

    let mut tx = reader_factory.start();
    assert_eq!(a.get(&mut tx).unwrap(), 0);
    writer_factory.atomically(|w| a.set(w, 5)).unwrap();

    // Opening anything else revalidates the read set.
    let result = b.get(&mut tx);
    assert!(matches!(result, Err(ThothError::ReadWriteConflict { .. })));
    assert_eq!(tx.status(), TransactionStatus::Aborted);
}

#[test]
fn test_unrelated_commit_does_not_conflict() {
    let thoth = setup_thoth(IsolationLevel::Serializable);
    let a = thoth.new_ref(0i64);
    let b = thoth.new_ref(0i64);
    let c = thoth.new_ref(0i64);
    let factory = update_factory(&thoth, "unrelated");

    let mut tx = factory.start();
    a.get(&mut tx).unwrap();
    factory.atomically(|w| c.set(w, 1)).unwrap();
    // The counter moved but the read set is still current.
    b.set(&mut tx, 1).unwrap();
    tx.commit().unwrap();
    assert_eq!(b.atomic_get().unwrap(), 1);
}

#[test]
fn test_write_skew_allowed_by_snapshot_only() {
    fn run(isolation: IsolationLevel) -> (Result<()>, Result<()>) {
        let thoth = setup_thoth(isolation);
        let x = thoth.new_ref(0i64);
        let y = thoth.new_ref(0i64);
        let factory = update_factory(&thoth, "skew");

        let mut t1 = factory.start();
        let mut t2 = factory.start();
        x.get(&mut t1).unwrap();
        y.set(&mut t1, 1).unwrap();
        y.get(&mut t2).unwrap();
        x.set(&mut t2, 1).unwrap();

        let first = t1.prepare();
        let second = t2.prepare();
        let first = first.and_then(|()| t1.commit());
        let second = second.and_then(|()| t2.commit());
        (first, second)
    }

    let (first, second) = run(IsolationLevel::Snapshot);
    assert!(first.is_ok());
    assert!(second.is_ok());

    let (first, second) = run(IsolationLevel::Serializable);
    assert!(first.is_ok());
    assert!(
        matches!(second, Err(ThothError::ReadWriteConflict { .. })),
        "unexpected result: {:?}",
        second
    );
}

#[test]
fn test_ensure_blocks_other_writers() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let factory = update_factory(&thoth, "ensure");

    let mut owner = factory.start();
    r.ensure(&mut owner).unwrap();

    let mut intruder = factory.start();
    r.set(&mut intruder, 1).unwrap();
    let result = intruder.commit();
    assert!(matches!(result, Err(ThothError::WriteConflict { .. })));

    r.set(&mut owner, 2).unwrap();
    owner.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 2);
    assert_eq!(r.version(), 2);
}

#[test]
fn test_blocked_transaction_wakes_on_commit() {
    // A waits for r to become 1; B writes it.
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);

    let waiter = {
        let thoth = thoth.clone();
        let r = r.clone();
        thread::spawn(move || {
            let config = thoth
                .transaction_config("waiter")
                .with_timeout(Duration::from_secs(10));
            let factory = thoth.transaction_factory(config).unwrap();
            factory.atomically(|tx| r.await_value(tx, |value| *value == 1))
        })
    };

    thread::sleep(Duration::from_millis(50));
    let writer = update_factory(&thoth, "writer");
    writer.atomically(|tx| r.set(tx, 1)).unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), 1);
    assert_eq!(r.version(), 2);
}

#[test]
fn test_atomic_set_wakes_blocked_transaction() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);

    let waiter = {
        let thoth = thoth.clone();
        let r = r.clone();
        thread::spawn(move || {
            let config = thoth
                .transaction_config("atomic-waiter")
                .with_timeout(Duration::from_secs(10));
            let factory = thoth.transaction_factory(config).unwrap();
            factory.atomically(|tx| r.await_value(tx, |value| *value == 7))
        })
    };

    thread::sleep(Duration::from_millis(50));
    r.atomic_set(7).unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), 7);
    assert_eq!(r.version(), 2);
}

#[test]
fn test_read_lock_blocks_writers_until_released() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let readers = thoth
        .transaction_factory(
            thoth
                .transaction_config("read-locked")
                .with_readonly(false)
                .with_read_lock_mode(LockMode::Read)
                .with_write_lock_mode(LockMode::Read),
        )
        .unwrap();
    let writers = update_factory(&thoth, "plain-writer");

    let mut reader = readers.start();
    assert_eq!(r.get(&mut reader).unwrap(), 0);

    let mut writer = writers.start();
    r.set(&mut writer, 1).unwrap();
    assert!(matches!(
        writer.commit(),
        Err(ThothError::WriteConflict { .. })
    ));
    assert!(matches!(r.atomic_set(1), Err(ThothError::WriteConflict { .. })));
    assert_eq!(r.version(), 1);

    // Plain reads still get through a read lock.
    let mut other = writers.start();
    assert_eq!(r.get(&mut other).unwrap(), 0);
    other.commit().unwrap();

    reader.commit().unwrap();
    writers.atomically(|tx| r.set(tx, 1)).unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);
}

#[test]
fn test_read_lock_upgrade_needs_sole_holder() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let factory = thoth
        .transaction_factory(
            thoth
                .transaction_config("upgrading")
                .with_readonly(false)
                .with_read_lock_mode(LockMode::Read)
                .with_write_lock_mode(LockMode::Read),
        )
        .unwrap();

    let mut first = factory.start();
    let mut second = factory.start();
    r.get(&mut first).unwrap();
    r.get(&mut second).unwrap();

    // Both hold the read lock, so the upgrade at prepare fails.
    r.set(&mut first, 1).unwrap();
    let result = first.commit();
    assert!(matches!(result, Err(ThothError::WriteConflict { .. })));
    assert_eq!(first.status(), TransactionStatus::Aborted);

    // With the first one gone the second is the only holder.
    r.set(&mut second, 2).unwrap();
    second.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 2);
    assert_eq!(r.version(), 2);
}

#[test]
fn test_write_lock_at_open_excludes_other_writers() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let eager = thoth
        .transaction_factory(
            thoth
                .transaction_config("eager-writer")
                .with_readonly(false)
                .with_write_lock_mode(LockMode::Write),
        )
        .unwrap();

    let mut holder = eager.start();
    r.set(&mut holder, 1).unwrap();

    let mut contender = eager.start();
    let result = r.set(&mut contender, 2);
    assert!(is_conflict(&result));
    assert_eq!(contender.status(), TransactionStatus::Aborted);

    // Readers without a lock mode still see the committed value.
    let mut reader = update_factory(&thoth, "unlocked-reader").start();
    assert_eq!(r.get(&mut reader).unwrap(), 0);
    reader.commit().unwrap();

    holder.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);
}

#[test]
fn test_blocked_transaction_ignores_unrelated_commits() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let watched = thoth.new_ref(0i64);
    let unrelated = thoth.new_ref(0i64);
    let wakeups = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let thoth = thoth.clone();
        let watched = watched.clone();
        let wakeups = wakeups.clone();
        thread::spawn(move || {
            let config = thoth
                .transaction_config("ignores")
                .with_track_reads(true)
                .with_timeout(Duration::from_millis(300));
            let factory = thoth.transaction_factory(config).unwrap();
            factory.atomically(|tx| {
                wakeups.fetch_add(1, Ordering::SeqCst);
                watched.await_value(tx, |value| *value == 1)
            })
        })
    };

    let writer = update_factory(&thoth, "unrelated-writer");
    for value in 1..=5i64 {
        writer.atomically(|tx| unrelated.set(tx, value)).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    let result = waiter.join().unwrap();
    assert!(
        matches!(result, Err(ThothError::RetryTimeout { .. })),
        "unexpected result: {:?}",
        result
    );
    // The body ran once before blocking and was never woken.
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_each_commit_wakes_waiter_once() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let attempts = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let thoth = thoth.clone();
        let r = r.clone();
        let attempts = attempts.clone();
        thread::spawn(move || {
            let config = thoth
                .transaction_config("counting-waiter")
                .with_track_reads(true)
                .with_timeout(Duration::from_secs(10));
            let factory = thoth.transaction_factory(config).unwrap();
            factory.atomically(|tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                r.await_value(tx, |value| *value >= 3)
            })
        })
    };

    let writer = update_factory(&thoth, "stepper");
    for _ in 0..3 {
        thread::sleep(Duration::from_millis(30));
        writer
            .atomically(|tx| r.alter_and_get(tx, |value| value + 1).map(|_| ()))
            .unwrap();
    }

    assert_eq!(waiter.join().unwrap().unwrap(), 3);
    // At most one initial run plus one run per commit.
    let runs = attempts.load(Ordering::SeqCst);
    assert!((1..=4).contains(&runs), "runs: {}", runs);
}

#[test]
fn test_retry_without_blocking_allowed() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let config = thoth
        .transaction_config("no-blocking")
        .with_blocking_allowed(false);
    let factory = thoth.transaction_factory(config).unwrap();

    let result = factory.atomically(|tx| r.await_value(tx, |value| *value > 0));
    assert!(matches!(result, Err(ThothError::NoBlockingAllowed { .. })));
}

#[test]
fn test_retry_with_nothing_read() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let result: Result<()> = thoth.atomically(|tx| tx.retry());
    assert!(matches!(result, Err(ThothError::NoRetryPossible { .. })));
}

#[test]
fn test_cancellation_interrupts_blocked_retry() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let r = thoth.new_ref(0i64);
    let token = CancellationToken::new();

    let waiter = {
        let thoth = thoth.clone();
        let r = r.clone();
        let token = token.clone();
        thread::spawn(move || {
            let factory = thoth
                .transaction_factory(thoth.transaction_config("cancelled"))
                .unwrap();
            factory.atomically_with_cancellation(&token, |tx| {
                r.await_value(tx, |value| *value == 1)
            })
        })
    };

    thread::sleep(Duration::from_millis(50));
    token.cancel();
    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(ThothError::Interrupted)));
    assert!(token.is_cancelled());
    assert_eq!(r.atomic_get().unwrap(), 0);
}

#[test]
fn test_concurrent_commuting_increments() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let counter = thoth.new_ref(0i64);
    let threads = 4;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let thoth = thoth.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                let factory = thoth
                    .transaction_factory(thoth.transaction_config("commuting-counter"))
                    .unwrap();
                for _ in 0..per_thread {
                    factory.atomically(|tx| counter.increment(tx, 1)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.atomic_get().unwrap(), threads * per_thread);
    assert_eq!(counter.version(), (threads * per_thread) as u64 + 1);
    let family = thoth.speculative_config("commuting-counter").unwrap();
    assert!(family.is_commute_required());
}

#[test]
fn test_random_transfers_preserve_total() {
    let thoth = setup_thoth(IsolationLevel::Snapshot);
    let accounts: Arc<Vec<TxnRef<i64>>> = Arc::new((0..8).map(|_| thoth.new_ref(1_000i64)).collect());
    let threads = 4;
    let transfers = 200;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let thoth = thoth.clone();
            let accounts = accounts.clone();
            thread::spawn(move || {
                let factory = thoth
                    .transaction_factory(thoth.transaction_config("transfer"))
                    .unwrap();
                let mut rng = rand::rng();
                for _ in 0..transfers {
                    let from = rng.random_range(0..accounts.len());
                    let to = rng.random_range(0..accounts.len());
                    let amount = rng.random_range(1..=50i64);
                    factory
                        .atomically(|tx| {
                            let balance = accounts[from].get(tx)?;
                            if balance < amount {
                                return Ok(());
                            }
                            accounts[from].set(tx, balance - amount)?;
                            accounts[to].alter_and_get(tx, |value| value + amount)?;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: i64 = thoth
        .atomically(|tx| {
            let mut total = 0;
            for account in accounts.iter() {
                total += account.get(tx)?;
            }
            Ok(total)
        })
        .unwrap();
    assert_eq!(total, 8 * 1_000);
    for account in accounts.iter() {
        assert!(account.atomic_get().unwrap() >= 0);
    }
}

#[test]
fn test_serializable_random_workload_keeps_invariant() {
    // Every transaction keeps x + y == 100 while moving a random amount.
    let thoth = setup_thoth(IsolationLevel::Serializable);
    let x = thoth.new_ref(50i64);
    let y = thoth.new_ref(50i64);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let thoth = thoth.clone();
            let x = x.clone();
            let y = y.clone();
            thread::spawn(move || {
                let factory = thoth
                    .transaction_factory(thoth.transaction_config("balanced"))
                    .unwrap();
                let mut rng = rand::rng();
                for _ in 0..100 {
                    let delta = rng.random_range(-5..=5i64);
                    factory
                        .atomically(|tx| {
                            let current = x.get(tx)?;
                            let other = y.get(tx)?;
                            assert_eq!(current + other, 100);
                            x.set(tx, current + delta)?;
                            y.set(tx, other - delta)
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(x.atomic_get().unwrap() + y.atomic_get().unwrap(), 100);
}
