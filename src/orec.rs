//! Ownership record: the versioned lock word attached to every reference.
//!
//! The whole state lives in one `AtomicU64` and every transition is a single
//! CAS, so the lock mode and the surplus can never be observed torn:
//!
//! ```text
//!  63 62 | 61          | 60 ........ 20 | 19 ........ 10 | 9 .......... 0
//!  lock  | read biased | surplus        | read holders   | readonly count
//! ```
//!
//! The version itself is carried by the committed node of the reference and is
//! only replaced while the orec is held in `Write` or `Exclusive` mode.
//!
//! Every operation spins a bounded number of times and then reports failure;
//! nothing here ever blocks.

use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;

use crate::config::LockMode;

const READONLY_COUNT_MASK: u64 = 0x3FF;
const READ_HOLDERS_SHIFT: u32 = 10;
const READ_HOLDERS_MASK: u64 = 0x3FF << READ_HOLDERS_SHIFT;
const SURPLUS_SHIFT: u32 = 20;
const SURPLUS_MASK: u64 = ((1u64 << 41) - 1) << SURPLUS_SHIFT;
const MAX_SURPLUS: u64 = (1u64 << 41) - 1;
const MAX_READ_HOLDERS: u64 = 0x3FF;
const READ_BIASED_BIT: u64 = 1 << 61;
const LOCK_MODE_SHIFT: u32 = 62;

/// Result of arriving at an orec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrive {
    /// Surplus was incremented; the caller owes a departure.
    Normal,
    /// The orec is read biased; nothing to depart from.
    Unregistered,
    /// The orec stayed locked for the whole spin budget.
    Locked,
}

impl Arrive {
    pub(crate) fn has_depart_obligation(self) -> bool {
        self == Arrive::Normal
    }
}

#[inline]
fn readonly_count(word: u64) -> u64 {
    word & READONLY_COUNT_MASK
}

#[inline]
fn read_holders(word: u64) -> u64 {
    (word & READ_HOLDERS_MASK) >> READ_HOLDERS_SHIFT
}

#[inline]
fn surplus(word: u64) -> u64 {
    (word & SURPLUS_MASK) >> SURPLUS_SHIFT
}

#[inline]
fn is_read_biased(word: u64) -> bool {
    word & READ_BIASED_BIT != 0
}

#[inline]
fn lock_mode(word: u64) -> LockMode {
    LockMode::from_bits(word >> LOCK_MODE_SHIFT)
}

#[inline]
fn with_readonly_count(word: u64, count: u64) -> u64 {
    (word & !READONLY_COUNT_MASK) | (count & READONLY_COUNT_MASK)
}

#[inline]
fn with_read_holders(word: u64, holders: u64) -> u64 {
    (word & !READ_HOLDERS_MASK) | ((holders << READ_HOLDERS_SHIFT) & READ_HOLDERS_MASK)
}

#[inline]
fn with_surplus(word: u64, surplus: u64) -> u64 {
    (word & !SURPLUS_MASK) | ((surplus << SURPLUS_SHIFT) & SURPLUS_MASK)
}

#[inline]
fn with_read_biased(word: u64, biased: bool) -> u64 {
    if biased {
        word | READ_BIASED_BIT
    } else {
        word & !READ_BIASED_BIT
    }
}

#[inline]
fn with_lock_mode(word: u64, mode: LockMode) -> u64 {
    (word & !(0b11 << LOCK_MODE_SHIFT)) | (mode.to_bits() << LOCK_MODE_SHIFT)
}

/// Applies the surplus change of an arrival. `None` when the surplus is full.
fn arrive_word(word: u64) -> Option<(u64, Arrive)> {
    let current = surplus(word);
    if is_read_biased(word) {
        if current > 0 {
            return Some((word, Arrive::Unregistered));
        }
        return Some((with_surplus(word, 1), Arrive::Unregistered));
    }
    if current == MAX_SURPLUS {
        return None;
    }
    Some((with_surplus(word, current + 1), Arrive::Normal))
}

/// Adds `mode` to the lock state if it is compatible with what is held.
fn lock_word(word: u64, mode: LockMode) -> Option<u64> {
    match (lock_mode(word), mode) {
        (_, LockMode::None) => Some(word),
        (LockMode::None, LockMode::Read) => {
            Some(with_lock_mode(with_read_holders(word, 1), LockMode::Read))
        }
        (LockMode::Read, LockMode::Read) => {
            let holders = read_holders(word);
            if holders == MAX_READ_HOLDERS {
                None
            } else {
                Some(with_read_holders(word, holders + 1))
            }
        }
        (LockMode::None, wanted) => Some(with_lock_mode(word, wanted)),
        _ => None,
    }
}

/// Removes `held` from the lock state.
fn unlock_word(word: u64, held: LockMode) -> u64 {
    match held {
        LockMode::None => word,
        LockMode::Read => {
            let holders = read_holders(word).saturating_sub(1);
            let word = with_read_holders(word, holders);
            if holders == 0 {
                with_lock_mode(word, LockMode::None)
            } else {
                word
            }
        }
        LockMode::Write | LockMode::Exclusive => with_lock_mode(word, LockMode::None),
    }
}

/// Readonly departure bookkeeping shared by the reading departures.
fn depart_reading_word(word: u64, threshold: u32) -> u64 {
    debug_assert!(!is_read_biased(word), "reading departure on a read biased orec");
    let remaining = surplus(word).saturating_sub(1);
    let count = (readonly_count(word) + 1).min(READONLY_COUNT_MASK);
    let word = with_surplus(word, remaining);
    if remaining == 0 && count >= u64::from(threshold) {
        with_readonly_count(with_read_biased(word, true), 0)
    } else {
        with_readonly_count(word, count)
    }
}

/// A snapshot of the orec word, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OrecState {
    pub lock_mode: LockMode,
    pub read_holders: u64,
    pub surplus: u64,
    pub read_biased: bool,
    pub readonly_count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Orec {
    word: AtomicU64,
}

impl Orec {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Creates an orec already held in `mode` by one arrived transaction.
    pub(crate) fn new_locked(mode: LockMode) -> Self {
        let word = lock_word(with_surplus(0, 1), mode).unwrap_or(0);
        Self {
            word: AtomicU64::new(word),
        }
    }

    pub(crate) fn state(&self) -> OrecState {
        let word = self.word.load(Ordering::Acquire);
        OrecState {
            lock_mode: lock_mode(word),
            read_holders: read_holders(word),
            surplus: surplus(word),
            read_biased: is_read_biased(word),
            readonly_count: readonly_count(word),
        }
    }

    pub(crate) fn lock_mode(&self) -> LockMode {
        lock_mode(self.word.load(Ordering::SeqCst))
    }

    /// CAS loop that spins only while `step` reports the state as not
    /// grantable. CAS failures caused by concurrent surplus changes retry
    /// without consuming the spin budget.
    fn transition<R>(
        &self,
        spin: u32,
        mut step: impl FnMut(u64) -> Option<(u64, R)>,
    ) -> Option<R> {
        let mut remaining = spin;
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            match step(current) {
                Some((next, result)) => {
                    if next == current {
                        return Some(result);
                    }
                    match self.word.compare_exchange_weak(
                        current,
                        next,
                        Ordering::SeqCst,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Some(result),
                        Err(actual) => current = actual,
                    }
                }
                None => {
                    if remaining == 0 {
                        return None;
                    }
                    remaining -= 1;
                    std::hint::spin_loop();
                    current = self.word.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Unconditional CAS loop for departures; those are always grantable.
    fn update(&self, mut step: impl FnMut(u64) -> u64) -> u64 {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let next = step(current);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Registers interest in the reference. Refused only while the commit lock
    /// is held; `Read` and `Write` locks admit arrivals.
    pub(crate) fn arrive(&self, spin: u32) -> Arrive {
        let arrived = self.transition(spin, |word| {
            if lock_mode(word) == LockMode::Exclusive {
                return None;
            }
            arrive_word(word)
        });
        match arrived {
            Some(arrive) => arrive,
            None => {
                trace!("arrive failed after {} spins", spin);
                Arrive::Locked
            }
        }
    }

    /// Arrives and acquires `mode` in a single CAS.
    pub(crate) fn arrive_and_lock(&self, spin: u32, mode: LockMode) -> Arrive {
        let arrived = self.transition(spin, |word| {
            let (next, arrive) = arrive_word(word)?;
            Some((lock_word(next, mode)?, arrive))
        });
        match arrived {
            Some(arrive) => arrive,
            None => {
                trace!("arrive_and_lock({:?}) failed after {} spins", mode, spin);
                Arrive::Locked
            }
        }
    }

    /// Acquires `mode` for a caller that already arrived. No side effects on
    /// failure.
    pub(crate) fn try_lock_after_arrive(&self, spin: u32, mode: LockMode) -> bool {
        let locked = self
            .transition(spin, |word| Some((lock_word(word, mode)?, ())))
            .is_some();
        if !locked {
            trace!("try_lock_after_arrive({:?}) failed after {} spins", mode, spin);
        }
        locked
    }

    /// Strengthens a lock the caller already holds. `Read` to `Write` needs
    /// the caller to be the only read holder; `Write` to `Exclusive` always
    /// succeeds.
    pub(crate) fn try_upgrade_lock(&self, spin: u32, held: LockMode, wanted: LockMode) -> bool {
        if wanted <= held {
            return true;
        }
        self.transition(spin, |word| match held {
            LockMode::None => Some((lock_word(word, wanted)?, ())),
            LockMode::Read => {
                if read_holders(word) != 1 {
                    return None;
                }
                Some((with_lock_mode(with_read_holders(word, 0), wanted), ()))
            }
            LockMode::Write | LockMode::Exclusive => Some((with_lock_mode(word, wanted), ())),
        })
        .is_some()
    }

    /// Departs after a successful readonly use of the reference.
    pub(crate) fn depart_after_reading(&self, threshold: u32) {
        let previous = self.update(|word| depart_reading_word(word, threshold));
        if is_read_biased(depart_reading_word(previous, threshold)) {
            trace!("orec became read biased");
        }
    }

    pub(crate) fn depart_after_reading_and_unlock(&self, threshold: u32, held: LockMode) {
        self.update(|word| depart_reading_word(unlock_word(word, held), threshold));
    }

    /// Undoes an arrival of an aborted transaction. Read biased orecs don't
    /// count their readers, so nothing is decremented there.
    pub(crate) fn depart_after_failure(&self) {
        self.update(|word| {
            if is_read_biased(word) {
                word
            } else {
                with_surplus(word, surplus(word).saturating_sub(1))
            }
        });
    }

    pub(crate) fn depart_after_failure_and_unlock(&self, held: LockMode) {
        self.update(|word| {
            let word = unlock_word(word, held);
            if is_read_biased(word) {
                word
            } else {
                with_surplus(word, surplus(word).saturating_sub(1))
            }
        });
    }

    /// Releases the lock after publishing a new value: the readonly streak
    /// restarts and read bias is cleared. Returns the number of other arrived
    /// transactions; on a read biased orec that number is unknown and the
    /// saturated surplus is returned.
    pub(crate) fn depart_after_update_and_unlock(&self, held: LockMode) -> u64 {
        let previous = self.update(|word| {
            let word = with_readonly_count(unlock_word(word, held), 0);
            if is_read_biased(word) {
                with_surplus(with_read_biased(word, false), 0)
            } else {
                with_surplus(word, surplus(word).saturating_sub(1))
            }
        });
        if is_read_biased(previous) {
            surplus(previous)
        } else {
            surplus(previous).saturating_sub(1)
        }
    }

    /// Releases a lock without departing.
    pub(crate) fn unlock(&self, held: LockMode) {
        self.update(|word| unlock_word(word, held));
    }
}
