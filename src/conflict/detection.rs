use crate::errors::ConflictType;
use crate::reference::tranlocal::{Tranlocal, TranlocalMode};

/// A tranlocal whose snapshot no longer matches the committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Conflict {
    pub ref_id: u64,
    pub conflict_type: ConflictType,
}

/// Checks every loaded tranlocal against the committed state of its reference.
///
/// An entry conflicts when its reference was committed past the version the
/// transaction loaded, or when another transaction holds a write lock on it
/// (that transaction may publish at any moment). Entries this transaction
/// holds a write lock on were already checked when the lock was taken.
/// Entries opened for write report `WriteWrite`, plain reads `ReadWrite`.
pub(crate) fn detect_conflicts(tranlocals: &[Tranlocal]) -> Option<Conflict> {
    tranlocals.iter().find_map(|tranlocal| {
        let conflict_type = match tranlocal.mode {
            TranlocalMode::Read => ConflictType::ReadWrite,
            TranlocalMode::Write => ConflictType::WriteWrite,
            TranlocalMode::Commuting | TranlocalMode::Constructing => return None,
        };
        if tranlocal.lock_mode.is_write() {
            return None;
        }
        let owner = &tranlocal.owner;
        let moved = owner.version() != tranlocal.read_version;
        if moved || owner.orec.lock_mode().is_write() {
            Some(Conflict {
                ref_id: owner.id,
                conflict_type,
            })
        } else {
            None
        }
    })
}
