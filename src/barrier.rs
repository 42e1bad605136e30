//! Commit barriers: multi-party gates that make several transactions commit
//! together or not at all.
//!
//! A joining transaction is prepared before it waits, so once the barrier
//! opens every party is known to be able to commit. Waiting happens on a
//! parking_lot `Condvar`; no orec lock is touched while waiting beyond the
//! ones held by the prepared transactions themselves.

use std::fmt;
use std::mem;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{Result, ThothError};
use crate::twopc::TwoPhaseCommitParticipant;

/// State of a commit barrier. Leaves `Closed` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierStatus {
    Closed,
    Committed,
    Aborted,
}

type Task = Box<dyn FnOnce() + Send>;

struct BarrierState {
    status: BarrierStatus,
    parties: usize,
    joined: usize,
    on_commit: Vec<Task>,
    on_abort: Vec<Task>,
}

struct BarrierCore {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl BarrierCore {
    fn new(status: BarrierStatus, parties: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                status,
                parties,
                joined: 0,
                on_commit: Vec::new(),
                on_abort: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn status(&self) -> BarrierStatus {
        self.state.lock().status
    }

    /// Moves a closed barrier to `target` and hands back the tasks to run
    /// once the lock is released.
    fn close_with(&self, state: &mut MutexGuard<'_, BarrierState>, target: BarrierStatus) -> Vec<Task> {
        state.status = target;
        self.cond.notify_all();
        let on_commit = mem::take(&mut state.on_commit);
        let on_abort = mem::take(&mut state.on_abort);
        match target {
            BarrierStatus::Committed => on_commit,
            _ => on_abort,
        }
    }

    fn finish(&self, target: BarrierStatus) -> std::result::Result<(), BarrierStatus> {
        let tasks = {
            let mut state = self.state.lock();
            if state.status != BarrierStatus::Closed {
                return Err(state.status);
            }
            self.close_with(&mut state, target)
        };
        debug!("commit barrier {:?}", target);
        tasks.into_iter().for_each(|task| task());
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        match self.finish(BarrierStatus::Aborted) {
            Ok(()) | Err(BarrierStatus::Aborted) => Ok(()),
            Err(status) => Err(open_error(status)),
        }
    }

    fn register_task(&self, task: Task, on_commit: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != BarrierStatus::Closed {
            return Err(open_error(state.status));
        }
        if on_commit {
            state.on_commit.push(task);
        } else {
            state.on_abort.push(task);
        }
        Ok(())
    }

    /// Blocks while the barrier is closed. `None` on timeout.
    fn wait(&self, deadline: Option<Instant>) -> Option<BarrierStatus> {
        let mut state = self.state.lock();
        while state.status == BarrierStatus::Closed {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && state.status == BarrierStatus::Closed
                    {
                        return None;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        Some(state.status)
    }

    /// Prepares `tx` and counts it as joined; the last counted party commits
    /// the barrier. `counted` is false for barriers without a party count.
    fn join<P: TwoPhaseCommitParticipant>(&self, tx: &mut P, counted: bool) -> Result<()> {
        let status = self.status();
        if status != BarrierStatus::Closed {
            let _ = tx.abort();
            return Err(open_error(status));
        }
        if let Err(err) = tx.prepare() {
            if counted {
                let _ = self.abort();
            }
            return Err(err);
        }

        let tasks = {
            let mut state = self.state.lock();
            if state.status != BarrierStatus::Closed {
                let status = state.status;
                drop(state);
                let _ = tx.abort();
                return Err(open_error(status));
            }
            state.joined += 1;
            if counted && state.joined >= state.parties {
                self.close_with(&mut state, BarrierStatus::Committed)
            } else {
                Vec::new()
            }
        };
        tasks.into_iter().for_each(|task| task());
        Ok(())
    }

    /// Finishes the joined `tx` according to the barrier outcome.
    fn complete<P: TwoPhaseCommitParticipant>(
        &self,
        tx: &mut P,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let status = match self.wait(deadline) {
            Some(status) => status,
            None => {
                // Timed out: abort the barrier unless it opened meanwhile.
                match self.finish(BarrierStatus::Aborted) {
                    Ok(()) => {
                        let _ = tx.abort();
                        return Ok(false);
                    }
                    Err(status) => status,
                }
            }
        };
        match status {
            BarrierStatus::Committed => tx.commit().map(|_| true),
            _ => {
                let _ = tx.abort();
                Err(ThothError::CommitBarrierAborted)
            }
        }
    }
}

fn open_error(status: BarrierStatus) -> ThothError {
    match status {
        BarrierStatus::Aborted => ThothError::CommitBarrierAborted,
        status => ThothError::CommitBarrierOpen(format!("barrier is {:?}", status)),
    }
}

/// Waits for a fixed number of parties; when the last one joins, every party
/// commits. If the barrier is aborted first, every party aborts.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::thread;
/// use thoth::prelude::*;
///
/// let thoth = Arc::new(Thoth::new(StmConfig::default()).unwrap());
/// let barrier = Arc::new(CountDownCommitBarrier::new(2));
/// let handles: Vec<_> = (0..2i64)
///     .map(|i| {
///         let thoth = thoth.clone();
///         let barrier = barrier.clone();
///         thread::spawn(move || {
///             let reference = thoth.new_ref(0i64);
///             let factory = thoth
///                 .transaction_factory(TransactionConfig::new("party").with_readonly(false))
///                 .unwrap();
///             let mut tx = factory.start();
///             reference.set(&mut tx, i).unwrap();
///             barrier.join_commit(&mut tx).unwrap();
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert!(barrier.is_committed());
/// ```
pub struct CountDownCommitBarrier {
    core: BarrierCore,
}

impl CountDownCommitBarrier {
    /// Creates a barrier for `parties` parties. With zero parties the barrier
    /// is committed from the start.
    pub fn new(parties: usize) -> Self {
        let status = if parties == 0 {
            BarrierStatus::Committed
        } else {
            BarrierStatus::Closed
        };
        Self {
            core: BarrierCore::new(status, parties),
        }
    }

    /// Adds one more party to wait for.
    pub fn register(&self) -> Result<()> {
        let mut state = self.core.state.lock();
        if state.status != BarrierStatus::Closed {
            return Err(open_error(state.status));
        }
        state.parties += 1;
        Ok(())
    }

    pub fn parties(&self) -> usize {
        self.core.state.lock().parties
    }

    /// Number of parties that joined and are waiting.
    pub fn number_waiting(&self) -> usize {
        let state = self.core.state.lock();
        if state.status == BarrierStatus::Closed {
            state.joined
        } else {
            0
        }
    }

    pub fn status(&self) -> BarrierStatus {
        self.core.status()
    }

    pub fn is_closed(&self) -> bool {
        self.status() == BarrierStatus::Closed
    }

    pub fn is_committed(&self) -> bool {
        self.status() == BarrierStatus::Committed
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == BarrierStatus::Aborted
    }

    /// Prepares `tx` and blocks until every party joined, then commits it.
    ///
    /// # Errors
    ///
    /// - [`ThothError::CommitBarrierAborted`] when the barrier is aborted
    ///   while waiting; `tx` is aborted.
    /// - [`ThothError::CommitBarrierOpen`] when the barrier already
    ///   committed; `tx` is aborted.
    /// - Any prepare error of `tx`; the barrier is aborted since it can no
    ///   longer complete.
    pub fn join_commit<P: TwoPhaseCommitParticipant>(&self, tx: &mut P) -> Result<()> {
        self.core.join(tx, true)?;
        self.core.complete(tx, None).map(|_| ())
    }

    /// Like [`join_commit`](Self::join_commit), but gives up after `timeout`:
    /// the barrier and `tx` are aborted and `Ok(false)` is returned.
    pub fn try_join_commit<P: TwoPhaseCommitParticipant>(
        &self,
        tx: &mut P,
        timeout: Duration,
    ) -> Result<bool> {
        self.core.join(tx, true)?;
        self.core.complete(tx, Some(Instant::now() + timeout))
    }

    /// Aborts the barrier, releasing every waiting party. Aborting an aborted
    /// barrier does nothing.
    pub fn abort(&self) -> Result<()> {
        self.core.abort()
    }

    /// Runs `task` when the barrier commits.
    pub fn register_on_commit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.core.register_task(Box::new(task), true)
    }

    /// Runs `task` when the barrier aborts.
    pub fn register_on_abort(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.core.register_task(Box::new(task), false)
    }
}

impl fmt::Debug for CountDownCommitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("CountDownCommitBarrier")
            .field("status", &state.status)
            .field("parties", &state.parties)
            .field("joined", &state.joined)
            .finish()
    }
}

/// Parties join and wait until one of them vetoes the commit, which commits
/// every party that joined.
pub struct VetoCommitBarrier {
    core: BarrierCore,
}

impl Default for VetoCommitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl VetoCommitBarrier {
    pub fn new() -> Self {
        Self {
            core: BarrierCore::new(BarrierStatus::Closed, 0),
        }
    }

    pub fn status(&self) -> BarrierStatus {
        self.core.status()
    }

    pub fn number_waiting(&self) -> usize {
        let state = self.core.state.lock();
        if state.status == BarrierStatus::Closed {
            state.joined
        } else {
            0
        }
    }

    /// Prepares `tx` and blocks until the barrier commits or aborts.
    pub fn join_commit<P: TwoPhaseCommitParticipant>(&self, tx: &mut P) -> Result<()> {
        self.core.join(tx, false)?;
        self.core.complete(tx, None).map(|_| ())
    }

    /// Like [`join_commit`](Self::join_commit) with a timeout, after which the
    /// barrier is aborted and `Ok(false)` returned.
    pub fn try_join_commit<P: TwoPhaseCommitParticipant>(
        &self,
        tx: &mut P,
        timeout: Duration,
    ) -> Result<bool> {
        self.core.join(tx, false)?;
        self.core.complete(tx, Some(Instant::now() + timeout))
    }

    /// Prepares `tx`, opens the barrier for every waiting party and commits
    /// `tx`.
    pub fn veto_commit<P: TwoPhaseCommitParticipant>(&self, tx: &mut P) -> Result<()> {
        let status = self.core.status();
        if status != BarrierStatus::Closed {
            let _ = tx.abort();
            return Err(open_error(status));
        }
        tx.prepare()?;
        if let Err(status) = self.core.finish(BarrierStatus::Committed) {
            let _ = tx.abort();
            return Err(open_error(status));
        }
        tx.commit()
    }

    pub fn abort(&self) -> Result<()> {
        self.core.abort()
    }

    pub fn register_on_commit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.core.register_task(Box::new(task), true)
    }

    pub fn register_on_abort(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.core.register_task(Box::new(task), false)
    }
}

/// Lets exactly one transaction through.
///
/// The first transaction to arrive is prepared and committed, which opens
/// the barrier. Every later arrival is aborted without being prepared and gets
/// [`ThothError::CommitBarrierOpen`]. If the first arrival fails to commit,
/// the barrier stays closed for the next one.
#[derive(Debug, Default)]
pub struct OnlyOneCommitBarrier {
    open: Mutex<bool>,
}

impl OnlyOneCommitBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    pub fn arrive<P: TwoPhaseCommitParticipant>(&self, tx: &mut P) -> Result<()> {
        let mut open = self.open.lock();
        if *open {
            drop(open);
            let _ = tx.abort();
            return Err(ThothError::CommitBarrierOpen(
                "another transaction already committed through the barrier".to_string(),
            ));
        }
        tx.prepare()?;
        tx.commit()?;
        *open = true;
        debug!("only-one commit barrier opened");
        Ok(())
    }
}
