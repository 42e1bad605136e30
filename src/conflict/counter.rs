use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine wide counter bumped once by every commit that writes something.
///
/// Transactions cache the value in a [`LocalConflictCounter`]; as long as the
/// counter hasn't moved, no reference anywhere changed and the read set needs
/// no validation.
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    counter: AtomicU64,
}

impl GlobalConflictCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_conflict(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// A transaction's cached copy of the [`GlobalConflictCounter`].
#[derive(Debug)]
pub struct LocalConflictCounter {
    global: Arc<GlobalConflictCounter>,
    local: u64,
}

impl LocalConflictCounter {
    pub fn new(global: Arc<GlobalConflictCounter>) -> Self {
        let local = global.count();
        Self { global, local }
    }

    /// Takes a fresh copy of the global counter. Called before the first read.
    pub fn reset(&mut self) {
        self.local = self.global.count();
    }

    /// Refreshes the copy and reports whether the global counter moved since
    /// the last reset or sync.
    pub fn sync_and_check_conflict(&mut self) -> bool {
        let global = self.global.count();
        if global == self.local {
            return false;
        }
        self.local = global;
        true
    }
}
