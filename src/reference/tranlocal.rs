use std::fmt;
use std::sync::Arc;

use crate::config::LockMode;
use crate::errors::Result;
use crate::reference::RefInner;
use crate::reference::value::Value;

/// A pending commuting update. Evaluated at prepare against the committed value.
pub(crate) type CommuteFn = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TranlocalMode {
    Read,
    Write,
    /// Only commuting functions are pending; the committed value has not been
    /// loaded.
    Commuting,
    /// The reference was created by this transaction and is not visible yet.
    Constructing,
}

/// The transaction-local copy of one reference.
pub(crate) struct Tranlocal {
    pub(crate) owner: Arc<RefInner>,
    pub(crate) value: Value,
    /// Value as loaded, for the dirty check.
    pub(crate) origin: Value,
    pub(crate) read_version: u64,
    pub(crate) mode: TranlocalMode,
    pub(crate) lock_mode: LockMode,
    pub(crate) has_depart_obligation: bool,
    pub(crate) is_dirty: bool,
    pub(crate) commute_fns: Vec<CommuteFn>,
}

impl Tranlocal {
    pub(crate) fn loaded(
        owner: Arc<RefInner>,
        value: Value,
        read_version: u64,
        has_depart_obligation: bool,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            owner,
            origin: value.clone(),
            value,
            read_version,
            mode: TranlocalMode::Read,
            lock_mode,
            has_depart_obligation,
            is_dirty: false,
            commute_fns: Vec::new(),
        }
    }

    pub(crate) fn commuting(owner: Arc<RefInner>) -> Self {
        Self {
            owner,
            value: Value::Null,
            origin: Value::Null,
            read_version: 0,
            mode: TranlocalMode::Commuting,
            lock_mode: LockMode::None,
            has_depart_obligation: false,
            is_dirty: false,
            commute_fns: Vec::new(),
        }
    }

    /// A freshly created reference. Its orec is created in the commit lock
    /// with one arrival, which this tranlocal owns.
    pub(crate) fn constructing(owner: Arc<RefInner>, value: Value) -> Self {
        Self {
            owner,
            value,
            origin: Value::Null,
            read_version: 0,
            mode: TranlocalMode::Constructing,
            lock_mode: LockMode::Exclusive,
            has_depart_obligation: true,
            is_dirty: true,
            commute_fns: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.owner.id
    }

    /// Loads the committed state into a commuting tranlocal, applying the
    /// pending functions; the tranlocal becomes a write.
    pub(crate) fn flush_commutes(
        &mut self,
        value: Value,
        read_version: u64,
        has_depart_obligation: bool,
        lock_mode: LockMode,
    ) -> Result<()> {
        self.origin = value.clone();
        self.value = value;
        self.read_version = read_version;
        self.has_depart_obligation = has_depart_obligation;
        self.lock_mode = lock_mode;
        self.mode = TranlocalMode::Write;
        self.apply_commutes()
    }

    pub(crate) fn apply_commutes(&mut self) -> Result<()> {
        for function in self.commute_fns.drain(..) {
            self.value = function(&self.value)?;
        }
        Ok(())
    }

    /// Decides whether the tranlocal has to be written at commit.
    pub(crate) fn compute_dirty(&mut self, dirty_check: bool) -> bool {
        self.is_dirty = match self.mode {
            TranlocalMode::Read => false,
            TranlocalMode::Constructing => true,
            TranlocalMode::Write | TranlocalMode::Commuting => {
                !dirty_check || !self.value.same(&self.origin)
            }
        };
        self.is_dirty
    }
}

impl fmt::Debug for Tranlocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("ref_id", &self.owner.id)
            .field("value", &self.value)
            .field("read_version", &self.read_version)
            .field("mode", &self.mode)
            .field("lock_mode", &self.lock_mode)
            .field("has_depart_obligation", &self.has_depart_obligation)
            .field("is_dirty", &self.is_dirty)
            .field("pending_commutes", &self.commute_fns.len())
            .finish()
    }
}
