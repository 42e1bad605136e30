use crate::errors::Result;
use crate::transaction::{Transaction, TransactionStatus};

/// A participant in a two-phase commit.
///
/// Commit barriers drive their parties through this trait: every party is
/// prepared first and only then told to commit or abort. [`Transaction`] is
/// the participant the engine ships with.
pub trait TwoPhaseCommitParticipant {
    /// Phase 1: make sure the participant can commit. A participant that
    /// fails to prepare has aborted.
    fn prepare(&mut self) -> Result<()>;

    /// Phase 2: make the prepared changes visible.
    fn commit(&mut self) -> Result<()>;

    /// Phase 2: discard the changes.
    fn abort(&mut self) -> Result<()>;

    fn status(&self) -> TransactionStatus;
}

impl TwoPhaseCommitParticipant for Transaction {
    fn prepare(&mut self) -> Result<()> {
        Transaction::prepare(self)
    }

    fn commit(&mut self) -> Result<()> {
        Transaction::commit(self)
    }

    fn abort(&mut self) -> Result<()> {
        Transaction::abort(self)
    }

    fn status(&self) -> TransactionStatus {
        Transaction::status(self)
    }
}
