use crate::transaction::TransactionStatus;

/// Points in the life of a transaction at which listeners are notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PreStart,
    PostStart,
    PrePrepare,
    PostPrepare,
    PostAbort,
    PreCommit,
    PostCommit,
}

/// A read-only view of the transaction handed to lifecycle listeners.
#[derive(Debug, Clone, Copy)]
pub struct TransactionView<'a> {
    pub id: u64,
    /// Zero-based attempt number within the retry driver.
    pub attempt: usize,
    pub family_name: &'a str,
    pub status: TransactionStatus,
    pub readonly: bool,
    pub tracking_reads: bool,
    /// Number of references opened.
    pub size: usize,
}

/// Receives lifecycle notifications.
///
/// Permanent listeners come from [`crate::TransactionConfig`] and see every
/// transaction of the family; listeners registered with
/// [`crate::Transaction::register_lifecycle_listener`] see the current attempt
/// only. Any `Fn(&TransactionView, LifecycleEvent)` closure is a listener.
pub trait TransactionLifecycleListener: Send + Sync {
    fn notify(&self, view: &TransactionView<'_>, event: LifecycleEvent);
}

impl<F> TransactionLifecycleListener for F
where
    F: Fn(&TransactionView<'_>, LifecycleEvent) + Send + Sync,
{
    fn notify(&self, view: &TransactionView<'_>, event: LifecycleEvent) {
        self(view, event)
    }
}
