//! Transactional references.
//!
//! A [`TxnRef<T>`] is a cheap handle over a shared [`RefInner`], which holds
//! the orec, the committed node and the chain of waiting listeners. Values are
//! stored as [`Value`]s and converted with [`TxnValue`].

pub mod tranlocal;
pub mod value;
pub mod versioned;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use log::trace;

use crate::config::LockMode;
use crate::errors::{Result, ThothError};
use crate::listeners::Listeners;
use crate::orec::{Arrive, Orec};
use crate::thoth::Runtime;
use crate::transaction::Transaction;

pub use value::{TxnValue, Value};
pub use versioned::VersionedValue;

/// A committed value and version loaded through the read barrier.
pub(crate) struct Loaded {
    pub(crate) value: Value,
    pub(crate) version: u64,
    pub(crate) arrive: Arrive,
}

/// Result of [`RefInner::try_lock_and_check_conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockOutcome {
    Locked { obligation: bool },
    /// The lock was acquired but the reference moved past the expected version.
    Stale { obligation: bool },
    /// The lock could not be acquired; nothing changed.
    Busy,
}

/// Family reported by conflicts of the non-transactional atomic operations.
pub const ATOMIC_FAMILY: &str = "atomic";

/// The shared part of a transactional reference.
pub struct RefInner {
    pub(crate) id: u64,
    pub(crate) orec: Orec,
    committed: Atomic<VersionedValue>,
    pub(crate) listeners: Listeners,
    runtime: Arc<Runtime>,
}

impl RefInner {
    pub(crate) fn new(runtime: &Arc<Runtime>, value: Value) -> Self {
        Self {
            id: runtime.next_ref_id(),
            orec: Orec::new(),
            committed: Atomic::new(VersionedValue::new(value, 1)),
            listeners: Listeners::new(),
            runtime: Arc::clone(runtime),
        }
    }

    /// A reference created inside a transaction: commit locked with one
    /// arrival until the creating transaction publishes version 1.
    pub(crate) fn new_constructed(runtime: &Arc<Runtime>) -> Self {
        Self {
            id: runtime.next_ref_id(),
            orec: Orec::new_locked(LockMode::Exclusive),
            committed: Atomic::new(VersionedValue::new(Value::Null, 0)),
            listeners: Listeners::new(),
            runtime: Arc::clone(runtime),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn with_committed<R>(&self, f: impl FnOnce(&VersionedValue) -> R) -> R {
        let guard = epoch::pin();
        let node = self.committed.load(Ordering::SeqCst, &guard);
        // SAFETY: the pointer is never null and replaced nodes are only
        // destroyed after every pinned guard is released.
        let node = unsafe { node.deref() };
        f(node)
    }

    /// Loads the committed node without any orec interaction.
    pub(crate) fn snapshot(&self) -> (Value, u64) {
        self.with_committed(|node| (node.value().clone(), node.version()))
    }

    pub(crate) fn version(&self) -> u64 {
        self.with_committed(VersionedValue::version)
    }

    /// The read barrier.
    ///
    /// On a read biased orec that isn't commit locked the node is read without
    /// any CAS. Otherwise the caller arrives (acquiring `lock` in the same CAS
    /// when asked), loads the node and re-checks the orec; a commit lock that
    /// showed up in between undoes the arrival and the load is retried. `None`
    /// once the spin budget is spent.
    pub(crate) fn load(&self, spin: u32, lock: LockMode) -> Option<Loaded> {
        let mut remaining = spin;
        loop {
            if lock == LockMode::None {
                let state = self.orec.state();
                if state.read_biased && state.lock_mode != LockMode::Exclusive {
                    let (value, version) = self.snapshot();
                    if self.orec.lock_mode() != LockMode::Exclusive {
                        return Some(Loaded {
                            value,
                            version,
                            arrive: Arrive::Unregistered,
                        });
                    }
                }
            }

            let arrive = if lock == LockMode::None {
                self.orec.arrive(spin)
            } else {
                self.orec.arrive_and_lock(spin, lock)
            };
            if arrive == Arrive::Locked {
                return None;
            }

            let (value, version) = self.snapshot();
            // While we hold a lock of our own nobody else can take the commit lock.
            if lock != LockMode::None || self.orec.lock_mode() != LockMode::Exclusive {
                return Some(Loaded {
                    value,
                    version,
                    arrive,
                });
            }

            if arrive.has_depart_obligation() {
                self.orec.depart_after_failure();
            }
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            std::hint::spin_loop();
        }
    }

    /// Acquires `mode` and checks that nobody committed since `expected_version`.
    ///
    /// `held` is the lock the caller already has and `arrived` whether it
    /// already owes a departure. A lock that was acquired stays held even when
    /// the version check fails; the caller records it and releases it on abort.
    pub(crate) fn try_lock_and_check_conflict(
        &self,
        spin: u32,
        held: LockMode,
        mode: LockMode,
        expected_version: u64,
        arrived: bool,
    ) -> LockOutcome {
        let mut obligation = arrived;
        let locked = if held != LockMode::None {
            self.orec.try_upgrade_lock(spin, held, mode)
        } else if arrived {
            self.orec.try_lock_after_arrive(spin, mode)
        } else {
            match self.orec.arrive_and_lock(spin, mode) {
                Arrive::Locked => false,
                arrive => {
                    obligation = arrive.has_depart_obligation();
                    true
                }
            }
        };
        if !locked {
            return LockOutcome::Busy;
        }
        if self.version() != expected_version {
            return LockOutcome::Stale { obligation };
        }
        LockOutcome::Locked { obligation }
    }

    /// Installs a new committed node. The caller holds the commit lock.
    pub(crate) fn publish(&self, value: Value, version: u64, guard: &Guard) {
        let old = self.committed.swap(
            Owned::new(VersionedValue::new(value, version)),
            Ordering::SeqCst,
            guard,
        );
        // SAFETY: the old node is unreachable for new readers once swapped out.
        unsafe { guard.defer_destroy(old) };
    }

    /// Updates the committed value outside of any transaction.
    ///
    /// This is a commit of a single reference: the commit lock is taken on
    /// arrival, `update` maps the committed value to the value to publish
    /// (`None` leaves the reference as it is), the global conflict counter
    /// moves before the next version is published and waiting listeners are
    /// woken once the lock is released.
    ///
    /// # Errors
    ///
    /// [`ThothError::WriteConflict`] when the commit lock can't be taken
    /// within the spin budget, or whatever `update` returns.
    pub(crate) fn atomic_update<R>(
        &self,
        update: impl FnOnce(&Value) -> Result<(Option<Value>, R)>,
    ) -> Result<R> {
        let config = &self.runtime.config;
        let arrive = self.orec.arrive_and_lock(config.spin_count, LockMode::Exclusive);
        if arrive == Arrive::Locked {
            return Err(ThothError::WriteConflict {
                family: ATOMIC_FAMILY.to_string(),
                ref_id: self.id,
            });
        }

        let (current, version) = self.snapshot();
        let (next, result) = match update(&current) {
            Ok((Some(next), result)) => (next, result),
            outcome => {
                if arrive.has_depart_obligation() {
                    self.orec.depart_after_reading_and_unlock(
                        config.read_biased_threshold,
                        LockMode::Exclusive,
                    );
                } else {
                    self.orec.unlock(LockMode::Exclusive);
                }
                return outcome.map(|(_, result)| result);
            }
        };

        self.runtime.global_conflict_counter.signal_conflict();
        {
            let guard = epoch::pin();
            self.publish(next, version + 1, &guard);
        }
        self.orec.depart_after_update_and_unlock(LockMode::Exclusive);
        let woken = self.listeners.drain_and_open();
        trace!(
            "atomic update of ref {} to version {}, woke {} waiters",
            self.id,
            version + 1,
            woken
        );
        Ok(result)
    }
}

impl Drop for RefInner {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the node.
        unsafe {
            let guard = epoch::unprotected();
            let node = self.committed.load(Ordering::Relaxed, guard);
            if !node.is_null() {
                drop(node.into_owned());
            }
        }
    }
}

impl fmt::Debug for RefInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, version) = self.snapshot();
        f.debug_struct("RefInner")
            .field("id", &self.id)
            .field("version", &version)
            .field("value", &value)
            .field("orec", &self.orec.state())
            .finish()
    }
}

pub(crate) fn convert<T: TxnValue>(ref_id: u64, value: &Value) -> Result<T> {
    T::from_value(value).ok_or(ThothError::TypeMismatch {
        ref_id,
        expected: std::any::type_name::<T>(),
    })
}

/// A typed transactional reference.
///
/// Cloning the handle is cheap; all clones refer to the same reference.
/// Reads and writes go through a [`Transaction`]; [`TxnRef::atomic_get`] and
/// [`TxnRef::version`] read the committed state directly, and the other
/// `atomic_*` operations update it without one.
///
/// # Examples
///
/// ```no_run
/// use thoth::prelude::*;
///
/// let thoth = Thoth::new(StmConfig::default()).unwrap();
/// let counter = thoth.new_ref(0i64);
/// let factory = thoth.transaction_factory(TransactionConfig::new("counter")).unwrap();
///
/// factory
///     .atomically(|tx| {
///         let value = counter.get(tx)?;
///         counter.set(tx, value + 1)
///     })
///     .unwrap();
/// assert_eq!(counter.atomic_get().unwrap(), 1);
/// ```
pub struct TxnRef<T> {
    inner: Arc<RefInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TxnRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TxnRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnRef")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version())
            .finish()
    }
}

impl<T: TxnValue> TxnRef<T> {
    pub(crate) fn from_inner(inner: Arc<RefInner>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RefInner> {
        &self.inner
    }

    /// Engine-unique identifier of the reference; also its lock order.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Version of the committed value. Starts at 1 and grows by one per
    /// committed write.
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// Reads the committed value outside of any transaction.
    pub fn atomic_get(&self) -> Result<T> {
        let (value, _) = self.inner.snapshot();
        convert(self.inner.id, &value)
    }

    /// Writes `value` outside of any transaction, as if a transaction writing
    /// only this reference committed. Transactions that read the old value
    /// conflict and blocked transactions waiting on the reference wake up.
    ///
    /// # Errors
    ///
    /// [`ThothError::WriteConflict`] when a transaction holds a lock on the
    /// reference for longer than the spin budget.
    pub fn atomic_set(&self, value: T) -> Result<()> {
        self.inner.atomic_update(|_| Ok((Some(value.into_value()), ())))
    }

    /// Like [`atomic_set`](TxnRef::atomic_set), returning the value it
    /// replaced.
    pub fn atomic_get_and_set(&self, value: T) -> Result<T> {
        let ref_id = self.inner.id;
        self.inner.atomic_update(|current| {
            let previous = convert(ref_id, current)?;
            Ok((Some(value.into_value()), previous))
        })
    }

    /// Applies `function` to the committed value outside of any transaction
    /// and returns the new value.
    pub fn atomic_alter_and_get<F>(&self, function: F) -> Result<T>
    where
        F: FnOnce(T) -> T,
    {
        let ref_id = self.inner.id;
        self.inner.atomic_update(|current| {
            let next = function(convert(ref_id, current)?).into_value();
            let result = convert(ref_id, &next)?;
            Ok((Some(next), result))
        })
    }

    pub fn get(&self, tx: &mut Transaction) -> Result<T> {
        tx.open_for_read(self)
    }

    pub fn set(&self, tx: &mut Transaction, value: T) -> Result<()> {
        let index = tx.open_for_write_index(&self.inner)?;
        tx.tranlocal_mut(index).value = value.into_value();
        Ok(())
    }

    /// Writes `value` and returns the value it replaced.
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> Result<T> {
        let index = tx.open_for_write_index(&self.inner)?;
        let previous = std::mem::replace(&mut tx.tranlocal_mut(index).value, value.into_value());
        convert(self.inner.id, &previous)
    }

    /// Applies `function` now and returns the new value.
    pub fn alter_and_get<F>(&self, tx: &mut Transaction, function: F) -> Result<T>
    where
        F: Fn(T) -> T,
    {
        let index = tx.open_for_write_index(&self.inner)?;
        let tranlocal = tx.tranlocal_mut(index);
        let current: T = convert(self.inner.id, &tranlocal.value)?;
        tranlocal.value = function(current).into_value();
        convert(self.inner.id, &tranlocal.value)
    }

    /// Applies `function` now and returns the value before it.
    pub fn get_and_alter<F>(&self, tx: &mut Transaction, function: F) -> Result<T>
    where
        F: Fn(T) -> T,
    {
        let index = tx.open_for_write_index(&self.inner)?;
        let tranlocal = tx.tranlocal_mut(index);
        let current: T = convert(self.inner.id, &tranlocal.value)?;
        let previous: T = convert(self.inner.id, &tranlocal.value)?;
        tranlocal.value = function(current).into_value();
        Ok(previous)
    }

    /// Schedules `function` to run against the committed value at commit.
    ///
    /// The reference is not read now, so concurrent commuting updates don't
    /// conflict with each other. If the transaction reads the reference later
    /// on, pending functions are applied at that point.
    pub fn commute<F>(&self, tx: &mut Transaction, function: F) -> Result<()>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let ref_id = self.inner.id;
        tx.commute_raw(
            &self.inner,
            Box::new(move |value: &Value| {
                let current: T = convert(ref_id, value)?;
                Ok(function(current).into_value())
            }),
        )
    }

    /// Returns the value once `predicate` holds, blocking the transaction
    /// through retry until a commit makes it true.
    pub fn await_value<P>(&self, tx: &mut Transaction, predicate: P) -> Result<T>
    where
        P: Fn(&T) -> bool,
    {
        let value = self.get(tx)?;
        if predicate(&value) {
            Ok(value)
        } else {
            tx.retry()
        }
    }

    /// Acquires the write lock now instead of at commit, so no other
    /// transaction can commit a write to the reference until this one ends.
    pub fn ensure(&self, tx: &mut Transaction) -> Result<()> {
        tx.ensure_raw(&self.inner)
    }
}

impl<T: TxnValue + PartialEq> TxnRef<T> {
    /// Writes `update` outside of any transaction if the committed value
    /// equals `expected`. Returns whether the write happened; a failed
    /// comparison leaves the version alone and wakes nobody.
    pub fn atomic_compare_and_set(&self, expected: &T, update: T) -> Result<bool> {
        let ref_id = self.inner.id;
        self.inner.atomic_update(|current| {
            let current: T = convert(ref_id, current)?;
            if current == *expected {
                Ok((Some(update.into_value()), true))
            } else {
                Ok((None, false))
            }
        })
    }
}

impl TxnRef<i64> {
    /// Commutes `value + amount`. Overflow wraps around.
    pub fn increment(&self, tx: &mut Transaction, amount: i64) -> Result<()> {
        self.commute(tx, move |value| value.wrapping_add(amount))
    }

    /// Commutes `value - amount`. Overflow wraps around.
    pub fn decrement(&self, tx: &mut Transaction, amount: i64) -> Result<()> {
        self.commute(tx, move |value| value.wrapping_sub(amount))
    }

    /// Adds `amount` outside of any transaction and returns the new value.
    /// Overflow wraps around.
    pub fn atomic_increment_and_get(&self, amount: i64) -> Result<i64> {
        self.atomic_alter_and_get(|value| value.wrapping_add(amount))
    }
}
