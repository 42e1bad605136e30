//! Wait handles for blocking retry.
//!
//! A transaction that calls retry registers one [`Latch`] on every reference
//! it read and then waits on it. A commit that writes one of those references
//! drains the reference's [`Listeners`] chain after publishing the new value
//! and opens every latch found there. Latches left behind on references that
//! never changed are pruned once their waiter is gone.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Closed,
    Open,
    /// Timed out or interrupted; the waiter is gone.
    Dead,
}

/// Outcome of [`Latch::await_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    Opened,
    TimedOut,
    Interrupted,
}

/// A one-shot gate a blocked transaction waits on.
///
/// Once open it stays open. A latch that timed out or was interrupted is dead:
/// opening it later has no effect, so a stale registration left on a
/// reference never wakes anybody.
#[derive(Debug)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Closed),
            cond: Condvar::new(),
        }
    }

    /// Opens the latch and wakes the waiter. Returns `true` only for the call
    /// that actually opened it.
    pub fn open(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LatchState::Closed {
            return false;
        }
        *state = LatchState::Open;
        self.cond.notify_all();
        true
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == LatchState::Open
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == LatchState::Closed
    }

    pub fn is_dead(&self) -> bool {
        *self.state.lock() == LatchState::Dead
    }

    /// Cancels the wait. The waiter returns [`LatchWait::Interrupted`] unless
    /// the latch was already open.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if *state == LatchState::Closed {
            *state = LatchState::Dead;
            self.cond.notify_all();
        }
    }

    /// Blocks until the latch opens, the timeout expires or the wait is
    /// interrupted. `None` waits without a deadline.
    pub fn await_open(&self, timeout: Option<Duration>) -> LatchWait {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            match *state {
                LatchState::Open => return LatchWait::Opened,
                LatchState::Dead => return LatchWait::Interrupted,
                LatchState::Closed => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && *state == LatchState::Closed
                    {
                        *state = LatchState::Dead;
                        return LatchWait::TimedOut;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

struct ListenerNode {
    latch: Arc<Latch>,
    next: Atomic<ListenerNode>,
}

/// The chain of latches waiting for a reference to change.
///
/// Registration pushes onto the head with a CAS. Draining swaps the head with
/// null, taking the whole chain at once. Latches that are no longer closed
/// are pruned by swapping in a rebuilt chain; a drain or push that got there
/// first makes the swap fail, so no waiting latch is ever lost. Unlinked
/// nodes are reclaimed through the epoch.
pub struct Listeners {
    head: Atomic<ListenerNode>,
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Registers `latch`, dropping stale latches from the chain on the way.
    pub fn push(&self, latch: Arc<Latch>) {
        self.rebuild(Some(latch));
    }

    /// Drops every latch that already opened, timed out or was interrupted.
    pub fn prune(&self) {
        self.rebuild(None);
    }

    fn rebuild(&self, latch: Option<Arc<Latch>>) {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let mut live = Vec::new();
            let mut stale = 0;
            let mut node = head;
            // SAFETY: nodes reachable while pinned are only destroyed through
            // the epoch.
            while let Some(current) = unsafe { node.as_ref() } {
                if current.latch.is_closed() {
                    live.push(Arc::clone(&current.latch));
                } else {
                    stale += 1;
                }
                node = current.next.load(Ordering::Acquire, guard);
            }

            if stale == 0 {
                let Some(latch) = latch.as_ref() else {
                    return;
                };
                let node = Owned::new(ListenerNode {
                    latch: Arc::clone(latch),
                    next: Atomic::from(head),
                });
                if self
                    .head
                    .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            let mut top = Shared::null();
            for survivor in live.into_iter().rev().chain(latch.iter().cloned()) {
                top = Owned::new(ListenerNode {
                    latch: survivor,
                    next: Atomic::from(top),
                })
                .into_shared(guard);
            }
            match self
                .head
                .compare_exchange(head, top, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    // SAFETY: the old chain is unlinked; readers still pinned
                    // on it keep it alive until they unpin.
                    unsafe { retire_chain(head, guard) };
                    return;
                }
                Err(_) => {
                    // SAFETY: the rebuilt chain was never published.
                    unsafe { free_chain(top, guard) };
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire, &epoch::pin()).is_null()
    }

    /// Number of registered latches, stale ones included.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        let mut node = self.head.load(Ordering::Acquire, guard);
        // SAFETY: see `rebuild`.
        while let Some(current) = unsafe { node.as_ref() } {
            count += 1;
            node = current.next.load(Ordering::Acquire, guard);
        }
        count
    }

    /// Takes the whole chain and opens every live latch once. Returns the
    /// number of latches opened.
    pub fn drain_and_open(&self) -> usize {
        let guard = &epoch::pin();
        let mut node = self.head.swap(Shared::null(), Ordering::AcqRel, guard);
        let mut opened = 0;
        // SAFETY: the swap unlinked the chain; pinned readers keep it alive.
        while let Some(current) = unsafe { node.as_ref() } {
            if current.latch.open() {
                opened += 1;
            }
            let next = current.next.load(Ordering::Acquire, guard);
            unsafe { guard.defer_destroy(node) };
            node = next;
        }
        opened
    }
}

/// Schedules every node of an unlinked chain for destruction.
unsafe fn retire_chain<'a>(mut node: Shared<'a, ListenerNode>, guard: &'a Guard) {
    while let Some(current) = unsafe { node.as_ref() } {
        let next = current.next.load(Ordering::Acquire, guard);
        unsafe { guard.defer_destroy(node) };
        node = next;
    }
}

/// Frees a chain no other thread has seen.
unsafe fn free_chain<'a>(mut node: Shared<'a, ListenerNode>, guard: &'a Guard) {
    while let Some(current) = unsafe { node.as_ref() } {
        let next = current.next.load(Ordering::Relaxed, guard);
        drop(unsafe { node.into_owned() });
        node = next;
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the chain.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Ordering::Relaxed, guard);
            free_chain(head, guard);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}
