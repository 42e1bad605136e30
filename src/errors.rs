use thiserror::Error;

use crate::transaction::TransactionStatus;

/// Represents the type of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// The transaction read a reference that was modified (or is being modified)
    /// by another transaction.
    ReadWrite,
    /// The transaction could not lock a reference it wants to write, or the
    /// reference was modified after it was opened.
    WriteWrite,
}

/// The capability a speculative transaction turned out to need.
///
/// Raised while a transaction runs under an optimistic (cheap) speculative
/// configuration. The retry driver upgrades the family configuration and
/// restarts the transaction; these never reach application code through
/// [`crate::TransactionFactory::atomically`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculativeFailure {
    /// A write was attempted while the family was assumed readonly.
    ReadonlyRequired,
    /// A blocking retry was requested but reads were not tracked.
    ListenersRequired,
    /// A commuting update was attempted while the family was assumed readonly.
    CommuteRequired,
}

#[derive(Error, Debug)]
pub enum ThothError {
    #[error("[{family}] read conflict on reference {ref_id}")]
    ReadWriteConflict { family: String, ref_id: u64 },

    #[error("[{family}] write conflict on reference {ref_id}")]
    WriteConflict { family: String, ref_id: u64 },

    #[error("Transaction retry requested")]
    Retry,

    #[error("Speculative configuration failure: {0:?}")]
    SpeculativeFailure(SpeculativeFailure),

    #[error("[{family}] can't {operation} a transaction with status {status:?}")]
    DeadTransaction {
        family: String,
        status: TransactionStatus,
        operation: &'static str,
    },

    #[error("[{family}] can't write to reference {ref_id} in a readonly transaction")]
    ReadonlyViolation { family: String, ref_id: u64 },

    #[error("[{family}] blocking is not allowed for this transaction")]
    NoBlockingAllowed { family: String },

    #[error("[{family}] retry is not possible, no tracked reads to listen on")]
    NoRetryPossible { family: String },

    #[error("Invalid transaction configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Commit barrier is already open: {0}")]
    CommitBarrierOpen(String),

    #[error("Commit barrier was aborted")]
    CommitBarrierAborted,

    #[error("[{family}] timed out waiting for a change")]
    RetryTimeout { family: String },

    #[error("Wait was interrupted")]
    Interrupted,

    #[error("Durability veto: {0}")]
    DurabilityVeto(String),

    #[error("[{family}] maximum number of {attempts} attempts reached: {cause}")]
    TooManyRetries {
        family: String,
        attempts: usize,
        cause: Box<ThothError>,
    },

    #[error("Reference {ref_id} does not hold a value of type {expected}")]
    TypeMismatch {
        ref_id: u64,
        expected: &'static str,
    },

    #[error("User error: {0}")]
    User(String),
}

impl ThothError {
    /// Returns the conflict type if this error is a recoverable conflict.
    pub fn conflict_type(&self) -> Option<ConflictType> {
        match self {
            ThothError::ReadWriteConflict { .. } => Some(ConflictType::ReadWrite),
            ThothError::WriteConflict { .. } => Some(ConflictType::WriteWrite),
            _ => None,
        }
    }

    /// Returns `true` for conflicts; the whole transaction body may be retried.
    pub fn is_conflict(&self) -> bool {
        self.conflict_type().is_some()
    }

    /// Returns `true` for signals that are consumed by the retry driver.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, ThothError::Retry | ThothError::SpeculativeFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, ThothError>;
