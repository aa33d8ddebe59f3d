// ============================================================================
// Range Ledger
// ============================================================================
//
// Tracks which message numbers of a sequence have been acknowledged (sending
// side) or received (receiving side) as a set of merged inclusive ranges.
//
// ============================================================================

pub mod range_set;

pub use range_set::{AckRange, RangeSet};
