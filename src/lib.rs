//! Thoth: orec-based Software Transactional Memory.
//!
//! Threads share [`TxnRef`]s and read or update them inside transactions.
//! Every reference carries an ownership record (orec) that tracks readers and
//! lock holders; transactions keep private copies of what they touch and
//! publish all of their writes at once on commit. Conflicts abort the
//! transaction and [`TransactionFactory::atomically`] runs it again.

pub mod barrier;
pub mod config;
pub mod conflict;
pub mod durability;
pub mod errors;
pub mod isolation;
pub mod lifecycle;
pub mod listeners;
mod orec;
pub mod reference;
pub mod speculative;
pub mod thoth;
pub mod transaction;
pub mod twopc;

// Re-export key types and structs for easier access
pub use barrier::{BarrierStatus, CountDownCommitBarrier, OnlyOneCommitBarrier, VetoCommitBarrier};
pub use config::{BackoffPolicy, LockMode, StmConfig, TransactionConfig};
pub use durability::{ChangeRecord, Durability};
pub use errors::{ConflictType, Result, SpeculativeFailure, ThothError};
pub use isolation::IsolationLevel;
pub use lifecycle::{LifecycleEvent, TransactionLifecycleListener, TransactionView};
pub use reference::{TxnRef, TxnValue, Value, VersionedValue};
pub use speculative::SpeculativeConfig;
pub use thoth::{AttemptOutcome, CancellationToken, Thoth, TransactionFactory, prelude};
pub use transaction::{Transaction, TransactionStatus};
pub use twopc::TwoPhaseCommitParticipant;

#[cfg(feature = "write-behind")]
pub use durability::WriteBehindQueue;
