/// Global and per-transaction conflict counters.
pub mod counter;
/// Validation of a transaction's read set.
pub mod detection;
