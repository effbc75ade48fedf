//! `Transaction`: an [`AtomicOperation`] whose commit is made
//! crash-recoverable by staging into a [`concourse_durability::IntentLog`]
//! before anything touches the Buffer.
//!
//! Plain atomic operations lose uncommitted work on a crash, which is fine
//! for a single automatically-retried call. A transaction is explicitly
//! opened and committed by a caller across possibly many operations, so its
//! intent is made durable as soon as it passes validation: if the process
//! dies after that point, [`concourse_durability::recovery::scan`] finds the
//! intent log on restart and finishes applying it.

use concourse_concurrency::{LockService, RangeLockService};
use concourse_core::{replay, Key, Operator, Record, Result, Value};
use concourse_durability::{IntentEntry, IntentLog};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::atomic::{AtomicOperation, AtomicState};
use crate::buffered_store::BufferedStore;

/// A durably-staged atomic operation.
pub struct Transaction {
    id: u64,
    op: AtomicOperation,
    intent: Option<IntentLog>,
}

impl Transaction {
    pub(crate) fn open(
        id: u64,
        intent_dir: &std::path::Path,
        store: Arc<BufferedStore>,
        locks: LockService,
        ranges: RangeLockService,
    ) -> Result<Self> {
        let intent = IntentLog::create(intent_dir, id)?;
        Ok(Transaction {
            id,
            op: AtomicOperation::new(store, locks, ranges),
            intent: Some(intent),
        })
    }

    /// The transaction's identifier, unique within an environment.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current state of the underlying atomic operation.
    pub fn state(&self) -> AtomicState {
        self.op.state()
    }

    /// Number of Writes buffered so far; the committer reserves this many
    /// consecutive versions before calling [`Transaction::commit`].
    pub fn pending_len(&self) -> usize {
        self.op.pending_len()
    }

    /// The backing intent log's path, for diagnostics.
    pub fn intent_log_path(&self) -> Option<PathBuf> {
        self.intent.as_ref().map(|log| log.path().to_path_buf())
    }

    /// Whether `value` is live at `(key, record)`, per this transaction's
    /// view (its own buffered writes included).
    pub fn verify(&mut self, key: &Key, value: &Value, record: Record) -> Result<bool> {
        self.op.verify(key, value, record)
    }

    /// The live value set for `(key, record)`, per this transaction's view.
    pub fn select(&mut self, key: &Key, record: Record) -> Result<Vec<Value>> {
        self.op.select(key, record)
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&mut self, key: &Key) -> Result<BTreeMap<Value, BTreeSet<Record>>> {
        self.op.browse(key)
    }

    /// Records for which `key`'s live value set matches `op`/`values`.
    pub fn find(&mut self, key: &Key, op: Operator, values: &[Value]) -> Result<BTreeSet<Record>> {
        self.op.find(key, op, values)
    }

    /// Every key on `record` mapped to its live value set.
    pub fn select_record(&mut self, record: Record) -> Result<BTreeMap<String, Vec<Value>>> {
        self.op.select_record(record)
    }

    /// The keys on `record` with at least one live value.
    pub fn describe(&mut self, record: Record) -> Result<BTreeSet<String>> {
        self.op.describe(record)
    }

    /// Records whose live String value at `key` matches the search `query`.
    pub fn search(&mut self, key: &Key, query: &str) -> Result<BTreeSet<Record>> {
        self.op.search(key, query)
    }

    /// The live value set after each Write to `(key, record)` with
    /// `start <= version < end`.
    pub fn chronologize(&mut self, key: &Key, record: Record, start: u64, end: u64) -> Result<Vec<replay::ChronologizeEntry>> {
        self.op.chronologize(key, record, start, end)
    }

    /// A version-ordered audit trail for `record`, optionally filtered to
    /// `key`.
    pub fn review(&mut self, record: Record, key: Option<&Key>) -> Result<Vec<(u64, String)>> {
        self.op.review(record, key)
    }

    /// Adds `value` to `(key, record)` if not already live.
    pub fn add(&mut self, key: Key, value: Value, record: Record) -> Result<bool> {
        self.op.add(key, value, record)
    }

    /// Removes `value` from `(key, record)` if currently live.
    pub fn remove(&mut self, key: Key, value: Value, record: Record) -> Result<bool> {
        self.op.remove(key, value, record)
    }

    /// Replaces `(key, record)`'s live value set with `{value}`.
    pub fn set(&mut self, key: Key, value: Value, record: Record) -> Result<()> {
        self.op.set(key, value, record)
    }

    /// Validates this transaction's read expectations, durably stages its
    /// buffered writes (a fsynced `Commit` entry is the durability
    /// boundary), and only then applies them to the store. A crash after
    /// the `Commit` entry is fsynced but before every write reaches the
    /// Buffer is repaired by [`concourse_durability::recovery::scan`] on
    /// the next startup.
    pub fn commit(mut self, next_version: u64) -> Result<Vec<u64>> {
        let staged = match self.op.validate_and_stage(next_version) {
            Ok(staged) => staged,
            Err(e) => {
                self.discard_intent();
                return Err(e);
            }
        };

        let mut intent = self.intent.take().expect("intent log already consumed");
        for write in &staged {
            if let Err(e) = intent.append(&IntentEntry::Stage { transaction_id: self.id, write: write.clone() }) {
                self.op.mark_failed();
                let _ = intent.discard();
                return Err(e);
            }
        }
        if let Err(e) = intent.append(&IntentEntry::Commit { transaction_id: self.id }) {
            self.op.mark_failed();
            let _ = intent.discard();
            return Err(e);
        }
        if let Err(e) = intent.fsync() {
            self.op.mark_failed();
            let _ = intent.discard();
            return Err(e);
        }

        let versions = self.op.apply_staged(staged)?;
        intent.discard()?;
        Ok(versions)
    }

    /// Rolls back: the intent log is discarded without ever recording a
    /// `Commit` entry, so recovery will never replay it.
    pub fn abort(mut self) {
        self.discard_intent();
        self.op.abort();
    }

    fn discard_intent(&mut self) {
        if let Some(intent) = self.intent.take() {
            let _ = intent.discard();
        }
    }
}

impl Drop for Transaction {
    /// A transaction dropped without an explicit `commit`/`abort` (e.g. a
    /// caller that errored out) leaves no durable trace: its intent log
    /// never reached `Commit`, so discarding it here is just cleanup, not a
    /// correctness requirement.
    fn drop(&mut self) {
        self.discard_intent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::{Key, Record, Value};
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, Arc<BufferedStore>, LockService, RangeLockService) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BufferedStore::open(&dir.path().join("store")).unwrap());
        (dir, store, LockService::new(), RangeLockService::new())
    }

    #[test]
    fn commit_applies_writes_and_discards_the_intent_log() {
        let (dir, store, locks, ranges) = harness();
        let intent_dir = dir.path().join("intents");
        std::fs::create_dir_all(&intent_dir).unwrap();

        let mut txn = Transaction::open(1, &intent_dir, store.clone(), locks, ranges).unwrap();
        let key = Key::new("name").unwrap();
        txn.add(key.clone(), Value::String("alice".into()), Record::new(1)).unwrap();
        let path = txn.intent_log_path().unwrap();
        txn.commit(1).unwrap();

        assert!(!path.exists());
        assert!(store.verify(&key, &Value::String("alice".into()), Record::new(1), None));
    }

    #[test]
    fn abort_discards_the_intent_log_without_applying_writes() {
        let (dir, store, locks, ranges) = harness();
        let intent_dir = dir.path().join("intents");
        std::fs::create_dir_all(&intent_dir).unwrap();

        let mut txn = Transaction::open(2, &intent_dir, store.clone(), locks, ranges).unwrap();
        let key = Key::new("name").unwrap();
        txn.add(key.clone(), Value::String("alice".into()), Record::new(1)).unwrap();
        let path = txn.intent_log_path().unwrap();
        txn.abort();

        assert!(!path.exists());
        assert!(!store.verify(&key, &Value::String("alice".into()), Record::new(1), None));
    }

    #[test]
    fn dropping_without_commit_or_abort_still_cleans_up_the_log() {
        let (dir, store, locks, ranges) = harness();
        let intent_dir = dir.path().join("intents");
        std::fs::create_dir_all(&intent_dir).unwrap();

        let path;
        {
            let txn = Transaction::open(3, &intent_dir, store, locks, ranges).unwrap();
            path = txn.intent_log_path().unwrap();
        }
        assert!(!path.exists());
    }
}
