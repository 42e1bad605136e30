use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use crossbeam_epoch as epoch;
use log::{debug, trace, warn};

use crate::config::{LockMode, TransactionConfig};
use crate::conflict::counter::LocalConflictCounter;
use crate::conflict::detection::{Conflict, detect_conflicts};
use crate::durability::ChangeRecord;
use crate::errors::{ConflictType, Result, SpeculativeFailure, ThothError};
use crate::lifecycle::{LifecycleEvent, TransactionLifecycleListener, TransactionView};
use crate::listeners::Latch;
use crate::reference::tranlocal::{CommuteFn, Tranlocal, TranlocalMode};
use crate::reference::{LockOutcome, RefInner, TxnRef, TxnValue, Value, convert};
use crate::speculative::{ResolvedMode, SpeculativeConfig};
use crate::thoth::Runtime;

/// The state of a transaction.
///
/// `Active -> Prepared -> Committed`, and `Active | Prepared -> Aborted`.
/// `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Prepared,
    Committed,
    Aborted,
}

impl TransactionStatus {
    /// Returns `true` while the transaction may still commit or abort.
    pub fn is_alive(self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Prepared)
    }
}

/// A single transaction.
///
/// A transaction keeps a private copy (a tranlocal) of every reference it
/// opens. Nothing is visible to other transactions until [`commit`] publishes
/// every changed reference at once, each with its version bumped by one.
/// Conflicts are detected while references are opened and again at
/// [`prepare`]; a conflicting transaction aborts and the retry driver runs the
/// body again.
///
/// Transactions are created by a [`crate::TransactionFactory`] and are reused
/// between the attempts of [`crate::TransactionFactory::atomically`].
///
/// [`commit`]: Transaction::commit
/// [`prepare`]: Transaction::prepare
pub struct Transaction {
    /// Unique identifier of the transaction.
    id: u64,
    /// Zero-based attempt within the retry driver.
    attempt: usize,
    status: TransactionStatus,
    config: Arc<TransactionConfig>,
    speculative: Arc<SpeculativeConfig>,
    runtime: Arc<Runtime>,
    /// Readonly and read tracking settings of the current attempt.
    mode: ResolvedMode,
    tranlocals: Vec<Tranlocal>,
    /// Reference id to position in `tranlocals`.
    index: HashMap<u64, usize>,
    local_conflict_counter: LocalConflictCounter,
    has_reads: bool,
    /// Id of the last reference read without tracking, if any.
    untracked_read: Option<u64>,
    /// Listeners registered for the current attempt only.
    listeners: Vec<Arc<dyn TransactionLifecycleListener>>,
    /// References holding a change listener of this transaction.
    watched: Vec<Arc<RefInner>>,
    remaining_timeout: Option<Duration>,
}

impl Transaction {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        config: Arc<TransactionConfig>,
        speculative: Arc<SpeculativeConfig>,
    ) -> Self {
        let mode = speculative.resolve(&config);
        let capacity = speculative.minimal_length();
        let mut transaction = Self {
            id: runtime.next_transaction_id(),
            attempt: 0,
            status: TransactionStatus::Active,
            local_conflict_counter: LocalConflictCounter::new(Arc::clone(
                &runtime.global_conflict_counter,
            )),
            remaining_timeout: config.timeout,
            config,
            speculative,
            runtime,
            mode,
            tranlocals: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            has_reads: false,
            untracked_read: None,
            listeners: Vec::new(),
            watched: Vec::new(),
        };
        transaction.begin();
        transaction
    }

    fn begin(&mut self) {
        self.notify(LifecycleEvent::PreStart);
        self.status = TransactionStatus::Active;
        debug!(
            "[{}] transaction {} started, attempt {} (readonly: {}, tracking reads: {})",
            self.config.family_name, self.id, self.attempt, self.mode.readonly, self.mode.track_reads
        );
        self.notify(LifecycleEvent::PostStart);
    }

    /// Returns the unique identifier of the transaction.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the zero-based attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn family_name(&self) -> &str {
        &self.config.family_name
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Whether the current attempt runs readonly. May be a speculative
    /// assumption that a write upgrades.
    pub fn is_readonly(&self) -> bool {
        self.mode.readonly
    }

    pub fn is_tracking_reads(&self) -> bool {
        self.mode.track_reads
    }

    /// Number of references opened by the current attempt.
    pub fn size(&self) -> usize {
        self.tranlocals.len()
    }

    /// Time left for blocking in retry, `None` when unbounded.
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    pub(crate) fn set_remaining_timeout(&mut self, remaining: Option<Duration>) {
        self.remaining_timeout = remaining;
    }

    /// Returns a read-only snapshot of the transaction for listeners.
    pub fn view(&self) -> TransactionView<'_> {
        TransactionView {
            id: self.id,
            attempt: self.attempt,
            family_name: &self.config.family_name,
            status: self.status,
            readonly: self.mode.readonly,
            tracking_reads: self.mode.track_reads,
            size: self.tranlocals.len(),
        }
    }

    /// Adds a listener notified of the remaining lifecycle events of the
    /// current attempt.
    pub fn register_lifecycle_listener(&mut self, listener: Arc<dyn TransactionLifecycleListener>) {
        self.listeners.push(listener);
    }

    fn notify(&self, event: LifecycleEvent) {
        if self.config.permanent_listeners.is_empty() && self.listeners.is_empty() {
            return;
        }
        let view = self.view();
        for listener in self
            .config
            .permanent_listeners
            .iter()
            .chain(self.listeners.iter())
        {
            listener.notify(&view, event);
        }
    }

    // --- errors ---

    fn dead(&self, operation: &'static str) -> ThothError {
        ThothError::DeadTransaction {
            family: self.config.family_name.clone(),
            status: self.status,
            operation,
        }
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.status == TransactionStatus::Active {
            Ok(())
        } else {
            Err(self.dead(operation))
        }
    }

    fn conflict_error(&self, conflict_type: ConflictType, ref_id: u64) -> ThothError {
        let family = self.config.family_name.clone();
        match conflict_type {
            ConflictType::ReadWrite => ThothError::ReadWriteConflict { family, ref_id },
            ConflictType::WriteWrite => ThothError::WriteConflict { family, ref_id },
        }
    }

    /// Aborts and hands back `err`.
    fn fail(&mut self, err: ThothError) -> ThothError {
        self.abort_internal();
        err
    }

    fn fail_conflict(&mut self, conflict_type: ConflictType, ref_id: u64) -> ThothError {
        let err = self.conflict_error(conflict_type, ref_id);
        trace!("transaction {} aborting: {}", self.id, err);
        self.fail(err)
    }

    fn speculative_failure(&mut self, failure: SpeculativeFailure) -> ThothError {
        self.speculative.signal(failure);
        self.fail(ThothError::SpeculativeFailure(failure))
    }

    fn readonly_failure(&mut self, ref_id: u64, failure: SpeculativeFailure) -> ThothError {
        if self.mode.speculative_readonly {
            self.speculative_failure(failure)
        } else {
            let family = self.config.family_name.clone();
            self.fail(ThothError::ReadonlyViolation { family, ref_id })
        }
    }

    // --- opening references ---

    /// Resets the local conflict counter before the first read of an attempt.
    /// Returns `true` for that first read.
    fn begin_read(&mut self) -> bool {
        if self.has_reads {
            return false;
        }
        self.local_conflict_counter.reset();
        self.has_reads = true;
        true
    }

    /// After the first read: if anything was committed anywhere since the
    /// last check, the read set must still match the committed state.
    fn check_read_conflict(&mut self, first_read: bool) -> Result<()> {
        if first_read || !self.local_conflict_counter.sync_and_check_conflict() {
            return Ok(());
        }
        if let Some(ref_id) = self.untracked_read {
            return Err(self.fail_conflict(ConflictType::ReadWrite, ref_id));
        }
        if let Some(Conflict {
            ref_id,
            conflict_type,
        }) = detect_conflicts(&self.tranlocals)
        {
            return Err(self.fail_conflict(conflict_type, ref_id));
        }
        Ok(())
    }

    fn attach(&mut self, tranlocal: Tranlocal) -> usize {
        let index = self.tranlocals.len();
        self.index.insert(tranlocal.id(), index);
        self.tranlocals.push(tranlocal);
        if self.tranlocals.len() > self.speculative.minimal_length() {
            self.speculative.signal_size(self.tranlocals.len());
        }
        index
    }

    /// Loads a reference into a new tracked tranlocal holding `lock`.
    fn open_tracked(&mut self, inner: &Arc<RefInner>, lock: LockMode) -> Result<usize> {
        let first_read = self.begin_read();
        let Some(loaded) = inner.load(self.config.spin_count, lock) else {
            let conflict_type = if lock.is_write() {
                ConflictType::WriteWrite
            } else {
                ConflictType::ReadWrite
            };
            return Err(self.fail_conflict(conflict_type, inner.id));
        };
        let index = self.attach(Tranlocal::loaded(
            Arc::clone(inner),
            loaded.value,
            loaded.version,
            loaded.arrive.has_depart_obligation(),
            lock,
        ));
        self.check_read_conflict(first_read)?;
        Ok(index)
    }

    /// Loads the committed value under a commuting tranlocal and applies the
    /// pending functions.
    fn flush_commuting(&mut self, index: usize) -> Result<()> {
        let inner = Arc::clone(&self.tranlocals[index].owner);
        let lock = self.config.write_lock_mode;
        let first_read = self.begin_read();
        let Some(loaded) = inner.load(self.config.spin_count, lock) else {
            return Err(self.fail_conflict(ConflictType::WriteWrite, inner.id));
        };
        if let Err(err) = self.tranlocals[index].flush_commutes(
            loaded.value,
            loaded.version,
            loaded.arrive.has_depart_obligation(),
            lock,
        ) {
            return Err(self.fail(err));
        }
        self.check_read_conflict(first_read)
    }

    /// Acquires `mode` on an already opened tranlocal and checks its version.
    fn lock_tranlocal(&mut self, index: usize, mode: LockMode) -> Result<()> {
        let tranlocal = &mut self.tranlocals[index];
        if tranlocal.lock_mode >= mode {
            return Ok(());
        }
        let ref_id = tranlocal.id();
        let outcome = tranlocal.owner.try_lock_and_check_conflict(
            self.config.spin_count,
            tranlocal.lock_mode,
            mode,
            tranlocal.read_version,
            tranlocal.has_depart_obligation,
        );
        match outcome {
            LockOutcome::Locked { obligation } => {
                tranlocal.lock_mode = mode;
                tranlocal.has_depart_obligation = obligation;
                Ok(())
            }
            LockOutcome::Stale { obligation } => {
                tranlocal.lock_mode = mode;
                tranlocal.has_depart_obligation = obligation;
                Err(self.fail_conflict(ConflictType::WriteWrite, ref_id))
            }
            LockOutcome::Busy => Err(self.fail_conflict(ConflictType::WriteWrite, ref_id)),
        }
    }

    /// Turns an opened tranlocal into a write.
    fn upgrade_to_write(&mut self, index: usize) -> Result<()> {
        match self.tranlocals[index].mode {
            TranlocalMode::Read => {
                self.tranlocals[index].mode = TranlocalMode::Write;
                let lock = self.config.write_lock_mode;
                if lock != LockMode::None {
                    self.lock_tranlocal(index, lock)?;
                }
                Ok(())
            }
            TranlocalMode::Commuting => self.flush_commuting(index),
            TranlocalMode::Write | TranlocalMode::Constructing => Ok(()),
        }
    }

    pub(crate) fn open_for_read_value(&mut self, inner: &Arc<RefInner>) -> Result<Value> {
        self.ensure_active("open_for_read")?;
        if let Some(&index) = self.index.get(&inner.id) {
            if self.tranlocals[index].mode == TranlocalMode::Commuting {
                self.flush_commuting(index)?;
            }
            return Ok(self.tranlocals[index].value.clone());
        }

        let lock = self.config.read_lock_mode;
        if self.mode.track_reads || lock != LockMode::None {
            let index = self.open_tracked(inner, lock)?;
            return Ok(self.tranlocals[index].value.clone());
        }

        let first_read = self.begin_read();
        let Some(loaded) = inner.load(self.config.spin_count, LockMode::None) else {
            return Err(self.fail_conflict(ConflictType::ReadWrite, inner.id));
        };
        if loaded.arrive.has_depart_obligation() {
            inner
                .orec
                .depart_after_reading(self.runtime.config.read_biased_threshold);
        }
        self.untracked_read = Some(inner.id);
        self.check_read_conflict(first_read)?;
        Ok(loaded.value)
    }

    pub(crate) fn open_for_write_index(&mut self, inner: &Arc<RefInner>) -> Result<usize> {
        self.ensure_active("open_for_write")?;
        if self.mode.readonly {
            return Err(self.readonly_failure(inner.id, SpeculativeFailure::ReadonlyRequired));
        }
        if let Some(&index) = self.index.get(&inner.id) {
            self.upgrade_to_write(index)?;
            return Ok(index);
        }
        let lock = self.config.write_lock_mode;
        let index = self.open_tracked(inner, lock)?;
        self.tranlocals[index].mode = TranlocalMode::Write;
        Ok(index)
    }

    pub(crate) fn tranlocal_mut(&mut self, index: usize) -> &mut Tranlocal {
        &mut self.tranlocals[index]
    }

    pub(crate) fn commute_raw(&mut self, inner: &Arc<RefInner>, function: CommuteFn) -> Result<()> {
        self.ensure_active("commute")?;
        if self.mode.readonly {
            return Err(self.readonly_failure(inner.id, SpeculativeFailure::CommuteRequired));
        }
        let Some(&index) = self.index.get(&inner.id) else {
            let mut tranlocal = Tranlocal::commuting(Arc::clone(inner));
            tranlocal.commute_fns.push(function);
            self.attach(tranlocal);
            return Ok(());
        };
        if self.tranlocals[index].mode == TranlocalMode::Commuting {
            self.tranlocals[index].commute_fns.push(function);
            return Ok(());
        }
        self.upgrade_to_write(index)?;
        let tranlocal = &mut self.tranlocals[index];
        match function(&tranlocal.value) {
            Ok(value) => {
                tranlocal.value = value;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub(crate) fn ensure_raw(&mut self, inner: &Arc<RefInner>) -> Result<()> {
        self.ensure_active("ensure")?;
        match self.index.get(&inner.id) {
            Some(&index) => {
                if self.tranlocals[index].mode == TranlocalMode::Commuting {
                    self.flush_commuting(index)?;
                }
                self.lock_tranlocal(index, LockMode::Write)
            }
            None => self.open_tracked(inner, LockMode::Write).map(|_| ()),
        }
    }

    /// Opens `reference` for reading and returns its value as seen by this
    /// transaction.
    ///
    /// # Errors
    ///
    /// - [`ThothError::ReadWriteConflict`] when the reference can't be loaded
    ///   or an earlier read went stale; the transaction is aborted.
    /// - [`ThothError::DeadTransaction`] when the transaction isn't active.
    pub fn open_for_read<T: TxnValue>(&mut self, reference: &TxnRef<T>) -> Result<T> {
        let value = self.open_for_read_value(reference.inner())?;
        convert(reference.id(), &value)
    }

    /// Opens `reference` for writing and returns its current value.
    ///
    /// The write stays private until commit. Writing in a speculatively
    /// readonly transaction aborts it with
    /// [`SpeculativeFailure::ReadonlyRequired`] so the driver can restart it
    /// as an update transaction.
    pub fn open_for_write<T: TxnValue>(&mut self, reference: &TxnRef<T>) -> Result<T> {
        let index = self.open_for_write_index(reference.inner())?;
        convert(reference.id(), &self.tranlocals[index].value)
    }

    /// Creates a reference that becomes visible to other transactions when
    /// this one commits, at version 1.
    pub fn open_for_construction<T: TxnValue>(&mut self, initial: T) -> Result<TxnRef<T>> {
        self.ensure_active("open_for_construction")?;
        let inner = Arc::new(RefInner::new_constructed(&self.runtime));
        if self.mode.readonly {
            return Err(self.readonly_failure(inner.id, SpeculativeFailure::ReadonlyRequired));
        }
        self.attach(Tranlocal::constructing(
            Arc::clone(&inner),
            initial.into_value(),
        ));
        Ok(TxnRef::from_inner(inner))
    }

    // --- blocking ---

    /// Asks to block until one of the references read so far changes.
    ///
    /// Always returns an error: [`ThothError::Retry`] for the driver to act on,
    /// or the reason blocking is impossible. The transaction stays active on
    /// `Retry` so listeners can be registered on its read set.
    pub fn retry<T>(&mut self) -> Result<T> {
        self.ensure_active("retry")?;
        if !self.config.blocking_allowed {
            let family = self.config.family_name.clone();
            return Err(self.fail(ThothError::NoBlockingAllowed { family }));
        }
        if !self.mode.track_reads {
            if self.mode.speculative_tracking {
                return Err(self.speculative_failure(SpeculativeFailure::ListenersRequired));
            }
            let family = self.config.family_name.clone();
            return Err(self.fail(ThothError::NoRetryPossible { family }));
        }
        if !self.tranlocals.iter().any(is_loaded) {
            let family = self.config.family_name.clone();
            return Err(self.fail(ThothError::NoRetryPossible { family }));
        }
        Err(ThothError::Retry)
    }

    /// Registers `latch` on every reference this transaction loaded and
    /// aborts. The latch opens on the next commit to any of them, or right
    /// away if one already moved past the version that was read.
    pub fn register_change_listener_and_abort(&mut self, latch: &Arc<Latch>) -> Result<()> {
        self.ensure_active("register_change_listener")?;
        if !self.config.blocking_allowed {
            let family = self.config.family_name.clone();
            return Err(self.fail(ThothError::NoBlockingAllowed { family }));
        }
        if !self.mode.track_reads && self.mode.speculative_tracking {
            return Err(self.speculative_failure(SpeculativeFailure::ListenersRequired));
        }

        let mut registered = 0;
        for tranlocal in self.tranlocals.iter().filter(|t| is_loaded(t)) {
            tranlocal.owner.listeners.push(Arc::clone(latch));
            self.watched.push(Arc::clone(&tranlocal.owner));
            registered += 1;
            if tranlocal.owner.version() != tranlocal.read_version {
                latch.open();
            }
        }
        if registered == 0 {
            let family = self.config.family_name.clone();
            return Err(self.fail(ThothError::NoRetryPossible { family }));
        }
        trace!(
            "transaction {} listening on {} references",
            self.id, registered
        );
        self.abort_internal();
        Ok(())
    }

    // --- prepare / commit / abort ---

    /// Locks the write set and validates the read set.
    ///
    /// Dirty writes are locked in ascending reference id order; a lock that
    /// can't be acquired within the spin budget aborts the transaction rather
    /// than waiting. Preparing a prepared transaction does nothing.
    ///
    /// # Errors
    ///
    /// - [`ThothError::WriteConflict`] when a write can't be locked or its
    ///   reference moved.
    /// - [`ThothError::ReadWriteConflict`] when read set validation fails.
    /// - [`ThothError::DurabilityVeto`] when the write-through hook refuses.
    /// - [`ThothError::DeadTransaction`] when already committed or aborted.
    ///
    /// The transaction is aborted on every error but the last.
    pub fn prepare(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => {}
            TransactionStatus::Prepared => return Ok(()),
            _ => return Err(self.dead("prepare")),
        }
        self.notify(LifecycleEvent::PrePrepare);
        if let Err(err) = self.prepare_writes() {
            trace!("transaction {} failed to prepare: {}", self.id, err);
            return Err(self.fail(err));
        }
        self.status = TransactionStatus::Prepared;
        self.notify(LifecycleEvent::PostPrepare);
        Ok(())
    }

    fn prepare_writes(&mut self) -> Result<()> {
        let spin = self.config.spin_count;
        let dirty_check = self.config.dirty_check;
        let mut order: Vec<usize> = (0..self.tranlocals.len()).collect();
        order.sort_unstable_by_key(|&index| self.tranlocals[index].id());

        for index in order {
            let tranlocal = &mut self.tranlocals[index];
            let ref_id = tranlocal.id();
            if tranlocal.mode == TranlocalMode::Commuting {
                let Some(loaded) = tranlocal.owner.load(spin, LockMode::Write) else {
                    return Err(self.conflict_error(ConflictType::WriteWrite, ref_id));
                };
                tranlocal.flush_commutes(
                    loaded.value,
                    loaded.version,
                    loaded.arrive.has_depart_obligation(),
                    LockMode::Write,
                )?;
            }
            if !tranlocal.compute_dirty(dirty_check) || tranlocal.lock_mode.is_write() {
                continue;
            }
            match tranlocal.owner.try_lock_and_check_conflict(
                spin,
                tranlocal.lock_mode,
                LockMode::Write,
                tranlocal.read_version,
                tranlocal.has_depart_obligation,
            ) {
                LockOutcome::Locked { obligation } => {
                    tranlocal.lock_mode = LockMode::Write;
                    tranlocal.has_depart_obligation = obligation;
                }
                LockOutcome::Stale { obligation } => {
                    tranlocal.lock_mode = LockMode::Write;
                    tranlocal.has_depart_obligation = obligation;
                    return Err(self.conflict_error(ConflictType::WriteWrite, ref_id));
                }
                LockOutcome::Busy => {
                    return Err(self.conflict_error(ConflictType::WriteWrite, ref_id));
                }
            }
        }

        let moved = self.local_conflict_counter.sync_and_check_conflict();
        if moved {
            if let Some(ref_id) = self.untracked_read {
                return Err(self.conflict_error(ConflictType::ReadWrite, ref_id));
            }
        }
        if moved || self.config.isolation_level.always_validates_reads() {
            if let Some(Conflict {
                ref_id,
                conflict_type,
            }) = detect_conflicts(&self.tranlocals)
            {
                return Err(self.conflict_error(conflict_type, ref_id));
            }
        }

        if self.config.durable {
            self.write_through()?;
        }
        Ok(())
    }

    fn change_records(&self) -> Vec<ChangeRecord> {
        self.tranlocals
            .iter()
            .filter(|tranlocal| tranlocal.is_dirty)
            .map(|tranlocal| ChangeRecord {
                ref_id: tranlocal.id(),
                version: tranlocal.read_version + 1,
                value: tranlocal.value.clone(),
            })
            .collect()
    }

    fn write_through(&self) -> Result<()> {
        let Some(durability) = self.runtime.durability.as_ref() else {
            return Ok(());
        };
        let changes = self.change_records();
        if changes.is_empty() {
            return Ok(());
        }
        durability.write_through(&changes).map_err(|err| {
            warn!(
                "[{}] transaction {} vetoed by durability: {}",
                self.config.family_name, self.id, err
            );
            match err {
                ThothError::DurabilityVeto(_) => err,
                other => ThothError::DurabilityVeto(other.to_string()),
            }
        })
    }

    /// Commits the transaction, preparing it first if needed.
    ///
    /// Every dirty write is published as a new committed value with its
    /// version bumped by one, then every lock and arrival is released and
    /// transactions blocked on the written references are woken. Committing a
    /// committed transaction does nothing.
    ///
    /// # Errors
    ///
    /// Any error of [`prepare`](Transaction::prepare), or
    /// [`ThothError::DeadTransaction`] for an aborted transaction.
    pub fn commit(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Committed => return Ok(()),
            TransactionStatus::Aborted => return Err(self.dead("commit")),
            TransactionStatus::Active => self.prepare()?,
            TransactionStatus::Prepared => {}
        }
        self.notify(LifecycleEvent::PreCommit);

        let threshold = self.runtime.config.read_biased_threshold;
        let changes = self.change_records();
        if !changes.is_empty() {
            for tranlocal in self.tranlocals.iter_mut().filter(|t| t.is_dirty) {
                let upgraded = tranlocal.owner.orec.try_upgrade_lock(
                    u32::MAX,
                    tranlocal.lock_mode,
                    LockMode::Exclusive,
                );
                // Prepare left a write lock on every dirty reference.
                debug_assert!(
                    upgraded,
                    "commit lock upgrade failed on ref {}",
                    tranlocal.owner.id
                );
                tranlocal.lock_mode = LockMode::Exclusive;
            }
            // Bumped before publishing: whoever sees a new value also sees the
            // counter move and revalidates.
            self.runtime.global_conflict_counter.signal_conflict();
            let guard = epoch::pin();
            for tranlocal in self.tranlocals.iter().filter(|t| t.is_dirty) {
                tranlocal.owner.publish(
                    tranlocal.value.clone(),
                    tranlocal.read_version + 1,
                    &guard,
                );
            }
        }

        let mut woken = 0;
        for tranlocal in self.tranlocals.drain(..) {
            if tranlocal.is_dirty {
                tranlocal
                    .owner
                    .orec
                    .depart_after_update_and_unlock(LockMode::Exclusive);
                woken += tranlocal.owner.listeners.drain_and_open();
            } else {
                release_after_reading(&tranlocal, threshold);
            }
        }
        self.index.clear();

        if !changes.is_empty() {
            debug!(
                "[{}] transaction {} committed {} writes, woke {} waiters",
                self.config.family_name,
                self.id,
                changes.len(),
                woken
            );
            if let Some(durability) = self.runtime.durability.as_ref() {
                durability.write_behind(changes);
            }
        } else {
            debug!(
                "[{}] transaction {} committed readonly",
                self.config.family_name, self.id
            );
        }

        self.status = TransactionStatus::Committed;
        self.notify(LifecycleEvent::PostCommit);
        Ok(())
    }

    /// Aborts the transaction, releasing every lock and arrival. Aborting an
    /// aborted transaction does nothing.
    ///
    /// # Errors
    ///
    /// [`ThothError::DeadTransaction`] when the transaction already committed.
    pub fn abort(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Aborted => Ok(()),
            TransactionStatus::Committed => Err(self.dead("abort")),
            TransactionStatus::Active | TransactionStatus::Prepared => {
                self.abort_internal();
                Ok(())
            }
        }
    }

    fn abort_internal(&mut self) {
        if !self.status.is_alive() {
            return;
        }
        for tranlocal in self.tranlocals.drain(..) {
            release_after_failure(&tranlocal);
        }
        self.index.clear();
        self.status = TransactionStatus::Aborted;
        debug!(
            "[{}] transaction {} aborted, attempt {}",
            self.config.family_name, self.id, self.attempt
        );
        self.notify(LifecycleEvent::PostAbort);
    }

    /// Aborts the transaction if it can still be aborted.
    pub(crate) fn abort_if_alive(&mut self) {
        self.abort_internal();
    }

    // --- reuse between attempts ---

    /// Removes the change listeners registered by the last retry once its
    /// latch opened, timed out or was interrupted.
    pub(crate) fn detach_change_listeners(&mut self) {
        for owner in self.watched.drain(..) {
            owner.listeners.prune();
        }
    }

    fn reset(&mut self) {
        self.abort_internal();
        self.detach_change_listeners();
        self.attempt += 1;
        self.tranlocals.clear();
        self.index.clear();
        self.has_reads = false;
        self.untracked_read = None;
        self.listeners.clear();
        self.mode = self.speculative.resolve(&self.config);
    }

    /// Prepares the transaction for the next attempt with the same settings.
    pub(crate) fn soft_reset(&mut self) {
        self.reset();
        self.begin();
    }

    /// Prepares the transaction for the next attempt after the family
    /// configuration was upgraded.
    pub(crate) fn hard_reset(&mut self) {
        self.reset();
        let capacity = self.speculative.minimal_length();
        self.tranlocals = Vec::with_capacity(capacity);
        self.index = HashMap::with_capacity(capacity);
        self.begin();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status.is_alive() {
            self.abort_internal();
        }
        self.detach_change_listeners();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("family", &self.config.family_name)
            .field("attempt", &self.attempt)
            .field("status", &self.status)
            .field("mode", &self.mode)
            .field("tranlocals", &self.tranlocals)
            .finish()
    }
}

/// Tranlocals that hold a loaded value a retry can listen on.
fn is_loaded(tranlocal: &Tranlocal) -> bool {
    matches!(tranlocal.mode, TranlocalMode::Read | TranlocalMode::Write)
}

fn release_after_reading(tranlocal: &Tranlocal, threshold: u32) {
    let orec = &tranlocal.owner.orec;
    match (tranlocal.has_depart_obligation, tranlocal.lock_mode) {
        (true, LockMode::None) => orec.depart_after_reading(threshold),
        (true, held) => orec.depart_after_reading_and_unlock(threshold, held),
        (false, LockMode::None) => {}
        (false, held) => orec.unlock(held),
    }
}

fn release_after_failure(tranlocal: &Tranlocal) {
    // A constructed reference was never published and stays commit locked.
    if tranlocal.mode == TranlocalMode::Constructing {
        return;
    }
    let orec = &tranlocal.owner.orec;
    match (tranlocal.has_depart_obligation, tranlocal.lock_mode) {
        (true, LockMode::None) => orec.depart_after_failure(),
        (true, held) => orec.depart_after_failure_and_unlock(held),
        (false, LockMode::None) => {}
        (false, held) => orec.unlock(held),
    }
}
