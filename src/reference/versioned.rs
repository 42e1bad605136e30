use crate::reference::value::Value;

/// A committed value together with the version it was committed at.
///
/// Each reference points to exactly one `VersionedValue` at a time. A commit
/// never mutates the node in place; it swaps in a new node with the next
/// version, so the value and its version are always read together.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    /// The committed value.
    value: Value,
    /// Number of commits that wrote the reference, starting at 1 when it is
    /// created.
    version: u64,
}

impl VersionedValue {
    /// Creates a new `VersionedValue`.
    ///
    /// # Arguments
    ///
    /// * `value` - The committed value.
    /// * `version` - The version associated with this value.
    pub fn new(value: Value, version: u64) -> Self {
        Self { value, version }
    }

    /// Returns a reference to the committed value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Returns the version of the value.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Builds the node that replaces this one when `value` is committed.
    pub fn next(&self, value: Value) -> Self {
        Self {
            value,
            version: self.version + 1,
        }
    }
}
