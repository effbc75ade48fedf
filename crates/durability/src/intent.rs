//! Per-transaction intent log entries: what an
//! [`crate::recovery`] replay needs to finish or discard a transaction that
//! was interrupted by a crash.
//!
//! Each [`AtomicOperation`](../../concourse_engine/struct.AtomicOperation.html)
//! (or the [`Transaction`](../../concourse_engine/struct.Transaction.html)
//! that extends it) stages its Writes into one of these logs before
//! applying any of them to a Buffer. A `Commit` entry is fsynced before the
//! first Write is applied; if the process dies before every staged Write
//! makes it into the Buffer, recovery replays the remainder from here.
//! Transactions that never reach `Commit` are safe to discard outright.

use serde::{Deserialize, Serialize};

/// One record in a transaction's intent log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IntentEntry {
    /// The transaction began staging writes.
    Begin {
        /// Opaque transaction identifier, unique within an environment.
        transaction_id: u64,
        /// Wall-clock time the transaction opened, for diagnostics only.
        timestamp: i64,
    },
    /// One Write staged as part of the transaction's pending commit.
    Stage {
        /// The transaction this write belongs to.
        transaction_id: u64,
        /// The write, already carrying the version it will commit at.
        write: concourse_core::Write,
    },
    /// The transaction passed version validation and is now durable: every
    /// staged Write will eventually be applied, crash or not.
    Commit {
        /// The transaction that committed.
        transaction_id: u64,
    },
    /// The transaction was rolled back; its staged writes must never be
    /// applied.
    Abort {
        /// The transaction that aborted.
        transaction_id: u64,
    },
}

impl IntentEntry {
    /// The transaction this entry belongs to.
    pub fn transaction_id(&self) -> u64 {
        match self {
            IntentEntry::Begin { transaction_id, .. }
            | IntentEntry::Stage { transaction_id, .. }
            | IntentEntry::Commit { transaction_id }
            | IntentEntry::Abort { transaction_id } => *transaction_id,
        }
    }

    /// Whether this is the terminal marker for a successful commit.
    pub fn is_commit(&self) -> bool {
        matches!(self, IntentEntry::Commit { .. })
    }

    /// Whether this is the terminal marker for a rollback.
    pub fn is_abort(&self) -> bool {
        matches!(self, IntentEntry::Abort { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_is_readable_from_every_variant() {
        let entries = vec![
            IntentEntry::Begin { transaction_id: 1, timestamp: 0 },
            IntentEntry::Commit { transaction_id: 1 },
            IntentEntry::Abort { transaction_id: 1 },
        ];
        for e in entries {
            assert_eq!(e.transaction_id(), 1);
        }
    }

    #[test]
    fn bincode_round_trips() {
        let entry = IntentEntry::Stage {
            transaction_id: 7,
            write: concourse_core::Write::new(
                concourse_core::WriteType::Add,
                concourse_core::Key::new("name").unwrap(),
                concourse_core::Value::String("alice".into()),
                concourse_core::Record::new(1),
                10,
            ),
        };
        let bytes = bincode::serialize(&entry).unwrap();
        let decoded: IntentEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(entry, decoded);
    }
}
