use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use ahash::AHashMap as HashMap;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{ANONYMOUS_FAMILY, StmConfig, TransactionConfig};
use crate::conflict::counter::GlobalConflictCounter;
use crate::durability::Durability;
use crate::errors::{Result, SpeculativeFailure, ThothError};
use crate::listeners::{Latch, LatchWait};
use crate::reference::{RefInner, TxnRef, TxnValue};
use crate::speculative::SpeculativeConfig;
use crate::transaction::Transaction;

/// Thoth Prelude
pub mod prelude {
    pub use crate::barrier::*;
    pub use crate::config::{BackoffPolicy, LockMode, StmConfig, TransactionConfig};
    pub use crate::durability::*;
    pub use crate::errors::*;
    pub use crate::isolation::IsolationLevel;
    pub use crate::lifecycle::*;
    pub use crate::listeners::{Latch, LatchWait};
    pub use crate::reference::{TxnRef, TxnValue, Value, VersionedValue};
    pub use crate::speculative::SpeculativeConfig;
    pub use crate::thoth::{AttemptOutcome, CancellationToken, Thoth, TransactionFactory};
    pub use crate::transaction::{Transaction, TransactionStatus};
    pub use crate::twopc::TwoPhaseCommitParticipant;
}

/// State shared by the engine handle, its factories and every transaction.
pub(crate) struct Runtime {
    pub(crate) config: StmConfig,
    pub(crate) global_conflict_counter: Arc<GlobalConflictCounter>,
    transaction_ids: AtomicU64,
    ref_ids: AtomicU64,
    pub(crate) durability: Option<Arc<dyn Durability>>,
}

impl Runtime {
    fn new(config: StmConfig, durability: Option<Arc<dyn Durability>>) -> Self {
        Self {
            config,
            global_conflict_counter: Arc::new(GlobalConflictCounter::new()),
            transaction_ids: AtomicU64::new(0),
            ref_ids: AtomicU64::new(0),
            durability,
        }
    }

    pub(crate) fn next_transaction_id(&self) -> u64 {
        self.transaction_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_ref_id(&self) -> u64 {
        self.ref_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The main entry point for the Thoth Software Transactional Memory system.
///
/// A `Thoth` handle owns the engine wide state: the global conflict counter,
/// id generators, the optional durability hook and the speculative
/// configuration of every transaction family. There is no global instance;
/// references and transactions only interact with the handle that created
/// them.
///
/// # Examples
///
/// ```no_run
/// use thoth::prelude::*;
///
/// let thoth = Thoth::new(StmConfig::default()).unwrap();
/// let from = thoth.new_ref(100i64);
/// let to = thoth.new_ref(0i64);
///
/// let transfer = thoth
///     .transaction_factory(TransactionConfig::new("transfer"))
///     .unwrap();
/// transfer
///     .atomically(|tx| {
///         let balance = from.get(tx)?;
///         from.set(tx, balance - 10)?;
///         to.alter_and_get(tx, |value| value + 10)?;
///         Ok(())
///     })
///     .unwrap();
///
/// assert_eq!(from.atomic_get().unwrap(), 90);
/// assert_eq!(to.atomic_get().unwrap(), 10);
/// ```
pub struct Thoth {
    runtime: Arc<Runtime>,
    /// Speculative configuration per family name.
    families: RwLock<HashMap<String, Arc<SpeculativeConfig>>>,
    default_factory: TransactionFactory,
}

impl Thoth {
    /// Creates a new engine without a durability hook.
    ///
    /// # Errors
    ///
    /// [`ThothError::InvalidConfiguration`] when `config` is rejected by
    /// [`StmConfig::validate`].
    pub fn new(config: StmConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a new engine whose durable transactions report their changes
    /// to `durability`.
    pub fn with_durability(config: StmConfig, durability: Arc<dyn Durability>) -> Result<Self> {
        Self::build(config, Some(durability))
    }

    fn build(config: StmConfig, durability: Option<Arc<dyn Durability>>) -> Result<Self> {
        config.validate()?;
        let runtime = Arc::new(Runtime::new(config, durability));
        let default_config = TransactionConfig::from_stm_config(ANONYMOUS_FAMILY, &runtime.config);
        let speculative = Arc::new(SpeculativeConfig::new(ANONYMOUS_FAMILY));
        let mut families = HashMap::new();
        families.insert(ANONYMOUS_FAMILY.to_string(), Arc::clone(&speculative));
        let default_factory = TransactionFactory {
            runtime: Arc::clone(&runtime),
            config: Arc::new(default_config),
            speculative,
        };
        debug!("thoth engine created: {:?}", runtime.config);
        Ok(Self {
            runtime,
            families: RwLock::new(families),
            default_factory,
        })
    }

    pub fn config(&self) -> &StmConfig {
        &self.runtime.config
    }

    /// Number of committed write batches so far.
    pub fn global_conflict_count(&self) -> u64 {
        self.runtime.global_conflict_counter.count()
    }

    /// Creates a reference holding `value` at version 1.
    pub fn new_ref<T: TxnValue>(&self, value: T) -> TxnRef<T> {
        let inner = RefInner::new(&self.runtime, value.into_value());
        TxnRef::from_inner(Arc::new(inner))
    }

    /// Returns a configuration for `family_name` seeded from the engine
    /// settings.
    pub fn transaction_config(&self, family_name: impl Into<String>) -> TransactionConfig {
        TransactionConfig::from_stm_config(family_name, &self.runtime.config)
    }

    /// Creates a factory for the family named in `config`.
    ///
    /// Factories of the same family share one speculative configuration, so
    /// an upgrade learned by one is seen by all.
    ///
    /// # Errors
    ///
    /// [`ThothError::InvalidConfiguration`] when `config` is rejected by
    /// [`TransactionConfig::validate`].
    pub fn transaction_factory(&self, config: TransactionConfig) -> Result<TransactionFactory> {
        config.validate()?;
        let speculative = self.family(&config.family_name);
        Ok(TransactionFactory {
            runtime: Arc::clone(&self.runtime),
            config: Arc::new(config),
            speculative,
        })
    }

    fn family(&self, family_name: &str) -> Arc<SpeculativeConfig> {
        if let Some(speculative) = self.families.read().get(family_name) {
            return Arc::clone(speculative);
        }
        let mut families = self.families.write();
        Arc::clone(
            families
                .entry(family_name.to_string())
                .or_insert_with(|| Arc::new(SpeculativeConfig::new(family_name))),
        )
    }

    /// Returns the speculative configuration learned for `family_name`, if a
    /// factory for it was ever created.
    pub fn speculative_config(&self, family_name: &str) -> Option<Arc<SpeculativeConfig>> {
        self.families.read().get(family_name).cloned()
    }

    /// Starts a transaction of the anonymous family.
    pub fn start_transaction(&self) -> Transaction {
        self.default_factory.start()
    }

    /// Runs `body` atomically in the anonymous family. See
    /// [`TransactionFactory::atomically`].
    pub fn atomically<R, F>(&self, body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        self.default_factory.atomically(body)
    }
}

impl fmt::Debug for Thoth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thoth")
            .field("config", &self.runtime.config)
            .field("families", &self.families.read().len())
            .field("durable", &self.runtime.durability.is_some())
            .finish()
    }
}

/// Starts transactions of one family and runs them to completion.
#[derive(Clone)]
pub struct TransactionFactory {
    runtime: Arc<Runtime>,
    config: Arc<TransactionConfig>,
    speculative: Arc<SpeculativeConfig>,
}

impl TransactionFactory {
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn speculative_config(&self) -> &Arc<SpeculativeConfig> {
        &self.speculative
    }

    /// Starts a transaction driven by the caller: nothing is retried and
    /// the caller commits or aborts it.
    pub fn start(&self) -> Transaction {
        Transaction::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.config),
            Arc::clone(&self.speculative),
        )
    }

    /// Runs `body` in a transaction and commits it, retrying until it
    /// commits.
    ///
    /// The body may run many times and must not have side effects outside the
    /// transaction. Between attempts:
    /// - a conflict backs off according to the family's [`BackoffPolicy`],
    /// - a speculative failure restarts with the upgraded configuration,
    /// - [`Transaction::retry`] blocks until a reference read by the attempt
    ///   changes.
    ///
    /// # Errors
    ///
    /// - [`ThothError::TooManyRetries`] after `max_retries` attempts, with the
    ///   cause of the last one.
    /// - [`ThothError::RetryTimeout`] when blocking in retry used up the
    ///   configured timeout.
    /// - Any other error of the body or of commit, unchanged. The transaction
    ///   is aborted.
    ///
    /// [`BackoffPolicy`]: crate::config::BackoffPolicy
    pub fn atomically<R, F>(&self, body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        self.drive(None, body)
    }

    /// Like [`atomically`](Self::atomically), but gives up with
    /// [`ThothError::Interrupted`] once `token` is cancelled. A transaction
    /// blocked in retry is woken by the cancellation.
    pub fn atomically_with_cancellation<R, F>(&self, token: &CancellationToken, body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        self.drive(Some(token), body)
    }

    fn drive<R, F>(&self, token: Option<&CancellationToken>, mut body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        let max_retries = self.config.max_retries;
        let mut tx = self.start();
        let mut last_cause = ThothError::Retry;

        for attempt in 0..max_retries {
            if attempt > 0 {
                trace!(
                    "[{}] transaction {} attempt {}",
                    self.config.family_name,
                    tx.id(),
                    attempt
                );
            }
            if token.is_some_and(CancellationToken::is_cancelled) {
                tx.abort_if_alive();
                return Err(ThothError::Interrupted);
            }

            let result = body(&mut tx);
            let reset = match AttemptOutcome::classify(&mut tx, result) {
                AttemptOutcome::Committed(value) => return Ok(value),
                AttemptOutcome::Failed(err) => {
                    tx.abort_if_alive();
                    return Err(err);
                }
                AttemptOutcome::Conflict(err) => {
                    tx.abort_if_alive();
                    last_cause = err;
                    self.config.backoff.backoff(attempt);
                    Reset::Soft
                }
                AttemptOutcome::SpeculativeUpgradeNeeded(failure) => {
                    tx.abort_if_alive();
                    last_cause = ThothError::SpeculativeFailure(failure);
                    Reset::Hard
                }
                AttemptOutcome::RetryBlocked => {
                    last_cause = ThothError::Retry;
                    self.block(&mut tx, token)?
                }
            };
            if attempt + 1 < max_retries {
                match reset {
                    Reset::Soft => tx.soft_reset(),
                    Reset::Hard => tx.hard_reset(),
                }
            }
        }

        tx.abort_if_alive();
        warn!(
            "[{}] giving up after {} attempts: {}",
            self.config.family_name, max_retries, last_cause
        );
        Err(ThothError::TooManyRetries {
            family: self.config.family_name.clone(),
            attempts: max_retries,
            cause: Box::new(last_cause),
        })
    }

    /// Registers a latch on the read set of `tx`, aborts it and waits for a
    /// change.
    fn block(&self, tx: &mut Transaction, token: Option<&CancellationToken>) -> Result<Reset> {
        let latch = Arc::new(Latch::new());
        if let Some(token) = token {
            token.register(&latch);
        }
        let registered = tx.register_change_listener_and_abort(&latch);
        if registered.is_err() {
            if let Some(token) = token {
                token.clear();
            }
        }
        match registered {
            Ok(()) => {}
            Err(ThothError::SpeculativeFailure(failure)) => {
                trace!(
                    "[{}] retry needs an upgrade first: {:?}",
                    self.config.family_name, failure
                );
                return Ok(Reset::Hard);
            }
            Err(err) => {
                tx.abort_if_alive();
                return Err(err);
            }
        }

        let remaining = tx.remaining_timeout();
        let started = Instant::now();
        let wait = latch.await_open(remaining);
        tx.detach_change_listeners();
        if let Some(token) = token {
            token.clear();
        }
        if let Some(remaining) = remaining {
            tx.set_remaining_timeout(Some(remaining.saturating_sub(started.elapsed())));
        }
        match wait {
            LatchWait::Opened => Ok(Reset::Soft),
            LatchWait::TimedOut => Err(ThothError::RetryTimeout {
                family: self.config.family_name.clone(),
            }),
            LatchWait::Interrupted => Err(ThothError::Interrupted),
        }
    }
}

impl fmt::Debug for TransactionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFactory")
            .field("config", &self.config)
            .field("speculative", &self.speculative)
            .finish()
    }
}

enum Reset {
    Soft,
    Hard,
}

/// What a single attempt of the retry driver ended with.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The body returned and the transaction committed.
    Committed(T),
    /// A read or write conflict; the attempt is retried after a backoff.
    Conflict(ThothError),
    /// The body asked to block until something it read changes.
    RetryBlocked,
    /// The family configuration was upgraded; the attempt restarts with it.
    SpeculativeUpgradeNeeded(SpeculativeFailure),
    /// Anything else; returned to the caller.
    Failed(ThothError),
}

impl<T> AttemptOutcome<T> {
    /// Commits `tx` if the body succeeded and classifies what happened.
    pub fn classify(tx: &mut Transaction, result: Result<T>) -> Self {
        match result.and_then(|value| tx.commit().map(|()| value)) {
            Ok(value) => AttemptOutcome::Committed(value),
            Err(err) => Self::from_error(err),
        }
    }

    /// Classifies the error an attempt failed with.
    pub fn from_error(err: ThothError) -> Self {
        match err {
            ThothError::Retry => AttemptOutcome::RetryBlocked,
            ThothError::SpeculativeFailure(failure) => {
                AttemptOutcome::SpeculativeUpgradeNeeded(failure)
            }
            err if err.is_conflict() => AttemptOutcome::Conflict(err),
            err => AttemptOutcome::Failed(err),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, AttemptOutcome::Committed(_))
    }
}

/// Cancels [`TransactionFactory::atomically_with_cancellation`] from another
/// thread. Clones share the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationState>,
}

#[derive(Default)]
struct CancellationState {
    cancelled: AtomicBool,
    /// Latch of the transaction currently blocked in retry.
    waiting: Mutex<Option<Arc<Latch>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the driver and interrupts its blocked retry, if any.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Some(latch) = self.inner.waiting.lock().as_ref() {
            latch.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, latch: &Arc<Latch>) {
        let mut waiting = self.inner.waiting.lock();
        *waiting = Some(Arc::clone(latch));
        // Checked under the lock so a concurrent cancel can't be missed.
        if self.is_cancelled() {
            latch.interrupt();
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.waiting.lock().take();
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
