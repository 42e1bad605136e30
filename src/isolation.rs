use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Defines the isolation levels supported by the Thoth Software Transactional Memory system.
///
/// Every level gives each transaction a consistent view of the references it
/// opened: an opened value never changes underneath the transaction and a read
/// conflict is detected as soon as a reference in the tracked read set moves.
/// The levels differ in how much work commit does to rule out anomalies between
/// concurrent committers.
pub enum IsolationLevel {
    /// **Snapshot:**
    ///
    /// The read set is revalidated at commit only if the local conflict counter
    /// shows that some transaction committed a write since the last check. When
    /// nothing changed anywhere the commit skips revalidation entirely, which is
    /// the cheap path for low contention.
    ///
    /// Two transactions that prepare at the same time, each reading what the other
    /// writes, may both commit. This is the classic write skew anomaly and it is
    /// allowed at this level.
    #[default]
    Snapshot,
    /// **Serializable:**
    ///
    /// Every tracked read is revalidated at commit after the write set is locked,
    /// and a read reference locked by another committer counts as a conflict.
    /// Write skew is therefore impossible: of two transactions reading each other's
    /// writes, at most one commits.
    ///
    /// Requires read tracking unless the transaction is readonly.
    Serializable,
}

impl IsolationLevel {
    /// Returns `true` if commit must always revalidate the full read set.
    pub fn always_validates_reads(self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}
