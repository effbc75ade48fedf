//! `BufferedStore`: the logical union of one environment's Buffer and
//! Database.
//!
//! A value is live at `(key, record, t)` according to every Write either
//! store holds for it -- versions are globally unique across the two, so
//! the live set is computed by merging both stores' Writes and replaying
//! them together, rather than computing each store's live set separately
//! and reconciling the two afterward.

use concourse_core::{replay, Key, Operator, Record, Result, Value, Write as CWrite};
use concourse_storage::regex_match::find_regex;
use concourse_storage::{Buffer, Database};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Default budget (in framed bytes) moved from Buffer to Database per
/// transfer cycle.
pub const DEFAULT_TRANSFER_BUDGET_BYTES: usize = 64 * 1024 * 1024;

pub(crate) fn default_page_size() -> usize {
    concourse_storage::page::DEFAULT_PAGE_SIZE_BYTES
}

/// Composes a Buffer (hot, unindexed, durable log) and a Database (cold,
/// indexed, sealed archive) into one queryable store.
pub struct BufferedStore {
    buffer: Buffer,
    database: Database,
}

impl BufferedStore {
    /// Opens (or creates) a BufferedStore rooted at `dir`, with the Buffer
    /// and Database each owning a subdirectory of it.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_at(&dir.join("buffer"), &dir.join("database"), crate::buffered_store::default_page_size())
    }

    /// Like [`BufferedStore::open`] but with an explicit Buffer page-size
    /// threshold (primarily for tests that want to force rollover quickly).
    pub fn open_with_page_size(dir: &Path, page_size_bytes: usize) -> Result<Self> {
        Self::open_at(&dir.join("buffer"), &dir.join("database"), page_size_bytes)
    }

    /// Opens a BufferedStore whose Buffer and Database live under separate
    /// roots, as the Engine lays environments out
    /// (`<buffer-root>/<env>` and `<db-root>/<env>`).
    pub fn open_at(buffer_dir: &Path, db_dir: &Path, page_size_bytes: usize) -> Result<Self> {
        let buffer = Buffer::open_with_page_size(buffer_dir, page_size_bytes)?;
        let database = Database::open(db_dir)?;
        Ok(BufferedStore { buffer, database })
    }

    /// Appends one Write to the Buffer. Callers hold whatever lock
    /// (`concourse-concurrency`) makes this safe to call concurrently with
    /// other mutations to the same key/record.
    pub fn insert(&self, write: CWrite) -> Result<()> {
        self.buffer.insert(write)
    }

    /// Fsyncs the Buffer's currently open page.
    pub fn fsync(&self) -> Result<()> {
        self.buffer.fsync()
    }

    fn merged(&self) -> Vec<CWrite> {
        let mut writes = self.buffer.all_writes_cloned();
        writes.extend(self.database.all_writes_cloned());
        writes
    }

    /// Whether `value` is currently live at `(key, record)`.
    pub fn verify(&self, key: &Key, value: &Value, record: Record, at: Option<u64>) -> bool {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::verify(&refs, key.as_str(), value, record, at)
    }

    /// The live value set for `(key, record)`.
    pub fn select(&self, key: &Key, record: Record, at: Option<u64>) -> Vec<Value> {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::select(&refs, key.as_str(), record, at)
    }

    /// Every key on `record` mapped to its live value set.
    pub fn select_record(&self, record: Record, at: Option<u64>) -> BTreeMap<String, Vec<Value>> {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::select_record(&refs, record, at)
    }

    /// The keys on `record` with at least one live value.
    pub fn describe(&self, record: Record, at: Option<u64>) -> BTreeSet<String> {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::describe(&refs, record, at)
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&self, key: &Key, at: Option<u64>) -> BTreeMap<Value, BTreeSet<Record>> {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::browse(&refs, key.as_str(), at)
    }

    /// Records whose live String value at `key` contains `query`'s tokens
    /// contiguously, across both stores.
    pub fn search(&self, key: &Key, query: &str, at: Option<u64>) -> BTreeSet<Record> {
        let browsed = self.browse(key, at);
        concourse_storage::search::find_matches(&browsed, query)
    }

    /// Records for which `key`'s live value set matches `op`/`values`.
    pub fn find(&self, key: &Key, op: Operator, values: &[Value], at: Option<u64>) -> Result<BTreeSet<Record>> {
        if matches!(op, Operator::Regex | Operator::NotRegex) {
            let pattern = match values {
                [Value::String(s)] | [Value::Tag(s)] => s.as_str(),
                _ => {
                    return Err(concourse_core::ConcourseError::InvalidArgument(
                        "regex operators take exactly one string operand".into(),
                    ))
                }
            };
            let browsed = self.browse(key, at);
            return find_regex(&browsed, op, pattern);
        }
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::find(&refs, key.as_str(), op, values, at))
    }

    /// The live value set after each Write to `(key, record)` with
    /// `start <= version < end`.
    pub fn chronologize(&self, key: &Key, record: Record, start: u64, end: u64) -> Vec<replay::ChronologizeEntry> {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::chronologize(&refs, key.as_str(), record, start, end)
    }

    /// A human-readable audit trail for `record`, optionally filtered to
    /// `key`.
    pub fn review(&self, record: Record, key: Option<&Key>) -> Vec<(u64, String)> {
        let writes = self.merged();
        let refs: Vec<&CWrite> = writes.iter().collect();
        replay::review(&refs, record, key.map(Key::as_str))
    }

    /// Every record either store has ever seen a Write for.
    pub fn all_records(&self) -> BTreeSet<Record> {
        let mut records = self.buffer.all_records();
        records.extend(self.database.all_records());
        records
    }

    /// Moves up to `max_bytes` of sealed Buffer pages into a new Database
    /// epoch, following the crash-safe protocol: the Database durably
    /// ingests the Writes before the Buffer is told to delete their pages.
    /// Returns the number of Writes transferred.
    pub fn transfer(&self, max_bytes: usize) -> Result<usize> {
        let batch = self.buffer.take_sealed(max_bytes);
        if batch.is_empty() {
            return Ok(0);
        }
        let writes: Vec<CWrite> = batch.iter().flat_map(|(_, ws)| ws.iter().cloned()).collect();
        let count = writes.len();
        let epoch = self.database.next_epoch();
        self.database.ingest(epoch, writes)?;
        let paths: Vec<_> = batch.into_iter().map(|(p, _)| p).collect();
        self.buffer.discard_pages(&paths)?;
        Ok(count)
    }

    /// Number of sealed Buffer pages not yet transferred.
    pub fn pending_transfer_pages(&self) -> usize {
        self.buffer.sealed_page_count()
    }

    /// Every Write this store currently holds, Buffer and Database
    /// combined. An [`crate::atomic::AtomicOperation`] overlays its own
    /// buffered (uncommitted) Writes onto this to see its own pending
    /// changes.
    pub fn snapshot(&self) -> Vec<CWrite> {
        self.merged()
    }

    /// Whether a Write at `version` is already present in either store.
    /// Versions are globally unique, so presence means the Write was
    /// durably applied -- intent-log replay uses this to stay idempotent.
    pub fn contains_version(&self, version: u64) -> bool {
        self.merged().iter().any(|w| w.version == version)
    }

    /// The highest version among Writes touching `key` (optionally
    /// narrowed to one `record`), or `0` if there are none. An
    /// [`crate::atomic::AtomicOperation`] records this as a
    /// `VersionExpectation` at read time and re-checks it at commit.
    pub fn current_version(&self, key: &Key, record: Option<Record>) -> u64 {
        self.merged()
            .iter()
            .filter(|w| w.key.as_str() == key.as_str())
            .filter(|w| record.map_or(true, |r| w.record == r))
            .map(|w| w.version)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::{Key, Record, Value, WriteType};
    use tempfile::tempdir;

    fn w(record: u64, version: u64) -> CWrite {
        CWrite::new(
            WriteType::Add,
            Key::new("name").unwrap(),
            Value::String("alice".into()),
            Record::new(record),
            version,
        )
    }

    #[test]
    fn reads_span_buffer_and_database_after_transfer() {
        let dir = tempdir().unwrap();
        let store = BufferedStore::open_with_page_size(dir.path(), 64).unwrap();
        store.insert(w(1, 1)).unwrap();
        store.insert(w(2, 2)).unwrap();
        store.fsync().unwrap();

        // force a sealed page so transfer has something to move
        for i in 3..200 {
            store.insert(w(i, i)).unwrap();
        }
        let moved = store.transfer(usize::MAX).unwrap();
        assert!(moved > 0);

        assert!(store.verify(&Key::new("name").unwrap(), &Value::String("alice".into()), Record::new(1), None));
        assert!(store.verify(&Key::new("name").unwrap(), &Value::String("alice".into()), Record::new(2), None));
    }
}
