//! Adaptive configuration shared by every transaction of a family.
//!
//! A family starts with the cheapest assumptions: readonly, reads untracked, no
//! commuting updates. The first transaction that needs more raises a
//! [`SpeculativeFailure`], the flag is set for good and the transaction is
//! restarted with the stronger setting. Flags only ever go up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;

use crate::config::TransactionConfig;
use crate::errors::SpeculativeFailure;
use crate::isolation::IsolationLevel;

#[derive(Debug)]
pub struct SpeculativeConfig {
    family_name: String,
    update_required: AtomicBool,
    listeners_required: AtomicBool,
    commute_required: AtomicBool,
    minimal_length: AtomicUsize,
}

impl SpeculativeConfig {
    pub fn new(family_name: impl Into<String>) -> Self {
        Self {
            family_name: family_name.into(),
            update_required: AtomicBool::new(false),
            listeners_required: AtomicBool::new(false),
            commute_required: AtomicBool::new(false),
            minimal_length: AtomicUsize::new(1),
        }
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    pub fn is_update_required(&self) -> bool {
        self.update_required.load(Ordering::Acquire)
    }

    pub fn is_listeners_required(&self) -> bool {
        self.listeners_required.load(Ordering::Acquire)
    }

    pub fn is_commute_required(&self) -> bool {
        self.commute_required.load(Ordering::Acquire)
    }

    /// Largest number of references a transaction of the family opened so far.
    pub fn minimal_length(&self) -> usize {
        self.minimal_length.load(Ordering::Acquire)
    }

    /// Records a failed assumption. Returns `true` if this call changed the
    /// configuration.
    pub fn signal(&self, failure: SpeculativeFailure) -> bool {
        let changed = match failure {
            SpeculativeFailure::ReadonlyRequired => {
                !self.update_required.fetch_or(true, Ordering::AcqRel)
            }
            SpeculativeFailure::ListenersRequired => {
                !self.listeners_required.fetch_or(true, Ordering::AcqRel)
            }
            SpeculativeFailure::CommuteRequired => {
                let commute = !self.commute_required.fetch_or(true, Ordering::AcqRel);
                let update = !self.update_required.fetch_or(true, Ordering::AcqRel);
                commute || update
            }
        };
        if changed {
            debug!(
                "[{}] speculative configuration upgraded: {:?}",
                self.family_name, failure
            );
        }
        changed
    }

    /// Grows the expected transaction size. Never restarts a transaction.
    pub fn signal_size(&self, length: usize) {
        let previous = self.minimal_length.fetch_max(length, Ordering::AcqRel);
        if length > previous {
            debug!(
                "[{}] speculative length grown from {} to {}",
                self.family_name, previous, length
            );
        }
    }

    /// Resolves the settings a new attempt runs with.
    pub(crate) fn resolve(&self, config: &TransactionConfig) -> ResolvedMode {
        let speculative = config.speculative_config_enabled;
        let readonly = config
            .readonly
            .unwrap_or(speculative && !self.is_update_required());
        let track_reads = config.track_reads.unwrap_or_else(|| {
            !speculative
                || self.is_listeners_required()
                // Update transactions can't validate untracked reads.
                || (!readonly && config.isolation_level == IsolationLevel::Serializable)
        });
        ResolvedMode {
            readonly,
            track_reads,
            speculative_readonly: speculative && config.readonly.is_none(),
            speculative_tracking: speculative && config.track_reads.is_none(),
        }
    }
}

/// The effective settings of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedMode {
    pub readonly: bool,
    pub track_reads: bool,
    /// Readonly was assumed and may be upgraded.
    pub speculative_readonly: bool,
    /// Untracked reads were assumed and may be upgraded.
    pub speculative_tracking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_cheap_and_only_upgrades() {
        let speculative = SpeculativeConfig::new("family");
        let config = TransactionConfig::new("family");

        let mode = speculative.resolve(&config);
        assert!(mode.readonly);
        assert!(!mode.track_reads);

        assert!(speculative.signal(SpeculativeFailure::ReadonlyRequired));
        assert!(!speculative.signal(SpeculativeFailure::ReadonlyRequired));
        let mode = speculative.resolve(&config);
        assert!(!mode.readonly);

        assert!(speculative.signal(SpeculativeFailure::ListenersRequired));
        let mode = speculative.resolve(&config);
        assert!(mode.track_reads);
        assert!(speculative.is_update_required());
    }

    #[test]
    fn fixed_settings_are_not_speculative() {
        let speculative = SpeculativeConfig::new("family");
        let config = TransactionConfig::new("family")
            .with_readonly(false)
            .with_track_reads(true);
        let mode = speculative.resolve(&config);
        assert!(!mode.readonly && mode.track_reads);
        assert!(!mode.speculative_readonly && !mode.speculative_tracking);

        let disabled = TransactionConfig::new("family").with_speculative_config_enabled(false);
        let mode = speculative.resolve(&disabled);
        assert!(!mode.readonly && mode.track_reads);
    }

    #[test]
    fn serializable_updates_track_reads() {
        let speculative = SpeculativeConfig::new("family");
        let config = TransactionConfig::new("family")
            .with_isolation_level(IsolationLevel::Serializable);
        speculative.signal(SpeculativeFailure::CommuteRequired);
        let mode = speculative.resolve(&config);
        assert!(!mode.readonly);
        assert!(mode.track_reads);
    }

    #[test]
    fn size_grows_monotonically() {
        let speculative = SpeculativeConfig::new("family");
        speculative.signal_size(8);
        speculative.signal_size(3);
        assert_eq!(speculative.minimal_length(), 8);
    }
}
