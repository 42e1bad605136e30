use crate::errors::Result;
use crate::reference::Value;

/// A single reference change made durable on behalf of a committing
/// transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Identifier of the written reference.
    pub ref_id: u64,
    /// The version the value is committed at.
    pub version: u64,
    /// The committed value.
    pub value: Value,
}

/// Hook for persisting the changes of committed transactions.
///
/// The engine never interprets what an implementation does with the records.
/// Implementations must be `Send` and `Sync`; every committing thread calls
/// into the same instance.
pub trait Durability: Send + Sync {
    /// Called during prepare of a durable transaction, after the write set is
    /// locked and validated and before anything is published.
    ///
    /// # Errors
    ///
    /// Any error vetoes the commit: the transaction aborts with
    /// [`crate::ThothError::DurabilityVeto`] and none of the changes become
    /// visible.
    fn write_through(&self, changes: &[ChangeRecord]) -> Result<()>;

    /// Called after every commit that wrote something, once the changes are
    /// visible. Best effort; the commit has already happened.
    fn write_behind(&self, changes: Vec<ChangeRecord>) {
        let _ = changes;
    }
}

#[cfg(feature = "write-behind")]
pub use queue::WriteBehindQueue;

#[cfg(feature = "write-behind")]
mod queue {
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use crossbeam_channel as channel;
    use log::{debug, warn};

    use super::{ChangeRecord, Durability};
    use crate::errors::Result;

    enum Job {
        Changes(Vec<ChangeRecord>),
        Flush(channel::Sender<()>),
    }

    /// Moves write-behind work of another [`Durability`] onto a background
    /// thread.
    ///
    /// Committing threads only enqueue; the worker hands batches to the inner
    /// implementation in commit order. Write-through calls are forwarded
    /// synchronously.
    pub struct WriteBehindQueue {
        inner: Arc<dyn Durability>,
        sender: Option<channel::Sender<Job>>,
        worker: Option<JoinHandle<()>>,
    }

    impl WriteBehindQueue {
        /// Creates a queue with unbounded capacity.
        pub fn new(inner: Arc<dyn Durability>) -> Self {
            Self::start(inner, channel::unbounded())
        }

        /// Creates a queue holding at most `capacity` batches; committers
        /// block while it is full.
        pub fn bounded(inner: Arc<dyn Durability>, capacity: usize) -> Self {
            Self::start(inner, channel::bounded(capacity))
        }

        fn start(
            inner: Arc<dyn Durability>,
            (sender, receiver): (channel::Sender<Job>, channel::Receiver<Job>),
        ) -> Self {
            let target = Arc::clone(&inner);
            let worker = thread::spawn(move || {
                for job in receiver.iter() {
                    match job {
                        Job::Changes(changes) => target.write_behind(changes),
                        Job::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("write-behind worker stopped");
            });
            Self {
                inner,
                sender: Some(sender),
                worker: Some(worker),
            }
        }

        /// Number of batches waiting for the worker.
        pub fn pending(&self) -> usize {
            self.sender.as_ref().map_or(0, channel::Sender::len)
        }

        /// Blocks until every batch enqueued before the call was handed to the
        /// inner implementation.
        pub fn flush(&self) {
            let Some(sender) = self.sender.as_ref() else {
                return;
            };
            let (done, wait) = channel::bounded(1);
            if sender.send(Job::Flush(done)).is_ok() {
                let _ = wait.recv();
            }
        }
    }

    impl Durability for WriteBehindQueue {
        fn write_through(&self, changes: &[ChangeRecord]) -> Result<()> {
            self.inner.write_through(changes)
        }

        fn write_behind(&self, changes: Vec<ChangeRecord>) {
            let Some(sender) = self.sender.as_ref() else {
                return;
            };
            if let Err(err) = sender.send(Job::Changes(changes)) {
                warn!("write-behind queue closed, dropping a batch: {}", err);
            }
        }
    }

    impl Drop for WriteBehindQueue {
        fn drop(&mut self) {
            // Closing the channel lets the worker drain what is queued and exit.
            self.sender.take();
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    warn!("write-behind worker panicked");
                }
            }
        }
    }
}
