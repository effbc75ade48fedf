//! Record identifiers.

use serde::{Deserialize, Serialize};

/// An unsigned 64-bit identifier naming a document.
///
/// Records are opaque to the storage engine: it never inspects or
/// interprets the integer, only compares and encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Record(u64);

impl Record {
    /// Wraps a raw identifier.
    pub const fn new(id: u64) -> Self {
        Record(id)
    }

    /// The raw identifier.
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl From<u64> for Record {
    fn from(id: u64) -> Self {
        Record(id)
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic generator of previously-unused record identifiers.
///
/// The real server derives records from a counter seeded at recovery time;
/// this is a minimal stand-in sufficient for the storage engine's own
/// `getAllRecords`-style bookkeeping.
#[derive(Debug, Default)]
pub struct RecordCounter(std::sync::atomic::AtomicU64);

impl RecordCounter {
    /// Creates a counter that will next mint `start`.
    pub fn starting_at(start: u64) -> Self {
        RecordCounter(std::sync::atomic::AtomicU64::new(start))
    }

    /// Mints the next unused record identifier.
    pub fn next(&self) -> Record {
        Record(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }
}
