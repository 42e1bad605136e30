use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ThothError};
use crate::isolation::IsolationLevel;
use crate::lifecycle::TransactionLifecycleListener;

/// Default number of times an orec operation spins before giving up.
pub const DEFAULT_SPIN_COUNT: u32 = 16;
/// Default number of attempts the retry driver makes before surfacing an error.
pub const DEFAULT_MAX_RETRIES: usize = 1000;
/// Default number of consecutive readonly departures after which an orec
/// becomes read biased.
pub const DEFAULT_READ_BIASED_THRESHOLD: u32 = 16;
/// Largest read biased threshold the orec readonly counter can represent.
pub const MAX_READ_BIASED_THRESHOLD: u32 = 1023;
/// Family name used when a configuration does not name one.
pub const ANONYMOUS_FAMILY: &str = "anonymous";

/// The lock a transaction holds on a reference.
///
/// Modes are ordered by strength: `None < Read < Write < Exclusive`.
/// `Read` is shared and keeps writers out. `Write` is held by a single
/// transaction and still admits readers. `Exclusive` is the commit lock and
/// admits nobody.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum LockMode {
    #[default]
    None,
    Read,
    Write,
    Exclusive,
}

impl LockMode {
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Write => 2,
            LockMode::Exclusive => 3,
        }
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Write,
            _ => LockMode::Exclusive,
        }
    }

    /// Returns `true` for the modes that keep other writers out and allow the
    /// holder to publish a new committed value.
    pub fn is_write(self) -> bool {
        matches!(self, LockMode::Write | LockMode::Exclusive)
    }
}

/// How the retry driver waits between attempts that failed on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Retry immediately.
    None,
    /// Yield for the first few attempts, then sleep for a doubling delay
    /// capped at `max_delay_micros`.
    Exponential {
        min_delay_micros: u64,
        max_delay_micros: u64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            min_delay_micros: 10,
            max_delay_micros: 10_000,
        }
    }
}

impl BackoffPolicy {
    const YIELD_ATTEMPTS: usize = 3;

    /// Returns the sleep for the given zero-based attempt, or `None` when the
    /// driver should only yield.
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        match *self {
            BackoffPolicy::None => None,
            BackoffPolicy::Exponential {
                min_delay_micros,
                max_delay_micros,
            } => {
                if attempt < Self::YIELD_ATTEMPTS {
                    return None;
                }
                let shift = (attempt - Self::YIELD_ATTEMPTS).min(32) as u32;
                let micros = min_delay_micros
                    .saturating_mul(1u64 << shift)
                    .min(max_delay_micros);
                Some(Duration::from_micros(micros))
            }
        }
    }

    /// Waits before the given zero-based attempt.
    pub fn backoff(&self, attempt: usize) {
        match self.delay_for(attempt) {
            Some(delay) => std::thread::sleep(delay),
            None => {
                if !matches!(self, BackoffPolicy::None) {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Engine wide settings, fixed when the [`crate::Thoth`] handle is built.
///
/// Values here seed [`TransactionConfig`]s created through
/// [`crate::Thoth::transaction_config`]; the read biased threshold applies to
/// every orec of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    pub spin_count: u32,
    /// Consecutive readonly departures before an orec turns read biased.
    pub read_biased_threshold: u32,
    pub max_retries: usize,
    pub isolation_level: IsolationLevel,
    pub speculative_config_enabled: bool,
    pub dirty_check: bool,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            spin_count: DEFAULT_SPIN_COUNT,
            read_biased_threshold: DEFAULT_READ_BIASED_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            isolation_level: IsolationLevel::default(),
            speculative_config_enabled: true,
            dirty_check: true,
        }
    }
}

impl StmConfig {
    /// Checks that the settings can be represented by the engine.
    pub fn validate(&self) -> Result<()> {
        if self.read_biased_threshold == 0 || self.read_biased_threshold > MAX_READ_BIASED_THRESHOLD
        {
            return Err(ThothError::InvalidConfiguration(format!(
                "read_biased_threshold must be in 1..={}, got {}",
                MAX_READ_BIASED_THRESHOLD, self.read_biased_threshold
            )));
        }
        Ok(())
    }
}

/// Configuration of a transaction family.
///
/// A family is every transaction started from the same
/// [`crate::TransactionFactory`]. `readonly` and `track_reads` left at `None`
/// are decided speculatively: the family starts with the cheap assumption and
/// upgrades it the first time a transaction needs more.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use thoth::prelude::*;
///
/// let config = TransactionConfig::new("transfer")
///     .with_isolation_level(IsolationLevel::Serializable)
///     .with_max_retries(100)
///     .with_timeout(Duration::from_secs(1));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub family_name: String,
    pub readonly: Option<bool>,
    pub track_reads: Option<bool>,
    pub blocking_allowed: bool,
    pub spin_count: u32,
    pub isolation_level: IsolationLevel,
    pub max_retries: usize,
    /// Total time a transaction may spend blocked in retry across attempts.
    pub timeout: Option<Duration>,
    /// Only write references whose value actually changed.
    pub dirty_check: bool,
    pub read_lock_mode: LockMode,
    pub write_lock_mode: LockMode,
    /// Call the engine's durability write-through hook during prepare.
    pub durable: bool,
    pub speculative_config_enabled: bool,
    pub backoff: BackoffPolicy,
    #[serde(skip)]
    pub permanent_listeners: Vec<Arc<dyn TransactionLifecycleListener>>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            family_name: ANONYMOUS_FAMILY.to_string(),
            readonly: None,
            track_reads: None,
            blocking_allowed: true,
            spin_count: DEFAULT_SPIN_COUNT,
            isolation_level: IsolationLevel::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            dirty_check: true,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            durable: false,
            speculative_config_enabled: true,
            backoff: BackoffPolicy::default(),
            permanent_listeners: Vec::new(),
        }
    }
}

impl fmt::Debug for TransactionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionConfig")
            .field("family_name", &self.family_name)
            .field("readonly", &self.readonly)
            .field("track_reads", &self.track_reads)
            .field("blocking_allowed", &self.blocking_allowed)
            .field("spin_count", &self.spin_count)
            .field("isolation_level", &self.isolation_level)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("dirty_check", &self.dirty_check)
            .field("read_lock_mode", &self.read_lock_mode)
            .field("write_lock_mode", &self.write_lock_mode)
            .field("durable", &self.durable)
            .field("speculative_config_enabled", &self.speculative_config_enabled)
            .field("backoff", &self.backoff)
            .field("permanent_listeners", &self.permanent_listeners.len())
            .finish()
    }
}

impl TransactionConfig {
    /// Creates a configuration with default settings for the named family.
    pub fn new(family_name: impl Into<String>) -> Self {
        Self {
            family_name: family_name.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration for the named family seeded from engine settings.
    pub fn from_stm_config(family_name: impl Into<String>, stm: &StmConfig) -> Self {
        Self {
            family_name: family_name.into(),
            spin_count: stm.spin_count,
            isolation_level: stm.isolation_level,
            max_retries: stm.max_retries,
            speculative_config_enabled: stm.speculative_config_enabled,
            dirty_check: stm.dirty_check,
            ..Self::default()
        }
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    pub fn with_track_reads(mut self, track_reads: bool) -> Self {
        self.track_reads = Some(track_reads);
        self
    }

    pub fn with_blocking_allowed(mut self, blocking_allowed: bool) -> Self {
        self.blocking_allowed = blocking_allowed;
        self
    }

    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_speculative_config_enabled(mut self, enabled: bool) -> Self {
        self.speculative_config_enabled = enabled;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a listener notified of every lifecycle event of every transaction
    /// in the family.
    pub fn with_permanent_listener(
        mut self,
        listener: Arc<dyn TransactionLifecycleListener>,
    ) -> Self {
        self.permanent_listeners.push(listener);
        self
    }

    /// Checks the configuration for combinations the engine can't honour.
    ///
    /// # Errors
    ///
    /// Returns [`ThothError::InvalidConfiguration`] when:
    /// - blocking is allowed but reads are explicitly untracked,
    /// - the isolation level is `Serializable`, reads are explicitly untracked
    ///   and the family is not fixed readonly,
    /// - `max_retries` is zero,
    /// - the read lock mode is stronger than the write lock mode,
    /// - a lock mode is `Exclusive` (reserved for commit).
    pub fn validate(&self) -> Result<()> {
        if self.blocking_allowed && self.track_reads == Some(false) {
            return Err(ThothError::InvalidConfiguration(format!(
                "[{}] blocking_allowed requires read tracking",
                self.family_name
            )));
        }
        if self.isolation_level == IsolationLevel::Serializable
            && self.track_reads == Some(false)
            && self.readonly != Some(true)
        {
            return Err(ThothError::InvalidConfiguration(format!(
                "[{}] Serializable isolation requires read tracking for update transactions",
                self.family_name
            )));
        }
        if self.max_retries == 0 {
            return Err(ThothError::InvalidConfiguration(format!(
                "[{}] max_retries must be at least 1",
                self.family_name
            )));
        }
        if self.read_lock_mode > self.write_lock_mode {
            return Err(ThothError::InvalidConfiguration(format!(
                "[{}] read_lock_mode {:?} can't be stronger than write_lock_mode {:?}",
                self.family_name, self.read_lock_mode, self.write_lock_mode
            )));
        }
        if self.write_lock_mode == LockMode::Exclusive {
            return Err(ThothError::InvalidConfiguration(format!(
                "[{}] Exclusive is the commit lock and can't be requested up front",
                self.family_name
            )));
        }
        Ok(())
    }
}
