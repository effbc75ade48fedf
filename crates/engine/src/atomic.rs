//! `AtomicOperation`: a buffered, lock-acquiring, optimistically-validated
//! unit of work against a [`BufferedStore`].
//!
//! Reads record a [`VersionExpectation`] and the read lock the operation
//! will need; writes buffer a [`Write`](CWrite) and the matching write
//! locks. Nothing is locked while the operation is OPEN -- the full lock
//! set is acquired at commit, in canonical token order, after which every
//! expectation is re-validated against the store's current state. A
//! conflicting committer that slipped in between read and commit therefore
//! fails the operation (the retry error) instead of corrupting it, and an
//! operation that merely buffered writes never blocks anyone else's commit.

use concourse_concurrency::{Extent, LockService, RangeGuard, RangeLockService, Token, WriteGuard};
use concourse_core::{replay, ConcourseError, Key, Operator, Record, Result, Value, Write as CWrite, WriteType};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffered_store::BufferedStore;

/// How long a commit-time lock acquisition may wait before the operation
/// is presumed deadlocked and told to retry. Stands in for a full wait-for
/// graph: the expired waiter plays the part of the aborted younger
/// operation.
const LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Where `AtomicOperation` is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicState {
    /// Accepting reads and buffering writes.
    Open,
    /// Validating expectations and appending writes; transient.
    Committing,
    /// Committed successfully; terminal.
    Committed,
    /// Validation failed at commit time; terminal. Callers should retry.
    Failed,
    /// Explicitly rolled back by the caller; terminal.
    Aborted,
}

/// The version a read observed for a resource, checked again at commit.
pub(crate) struct VersionExpectation {
    key: Key,
    record: Option<Record>,
    observed: u64,
}

fn value_token_bytes(v: &Value) -> Vec<u8> {
    let mut bytes = vec![v.type_tag()];
    bytes.extend(v.to_string().into_bytes());
    bytes
}

/// A buffered, serializable unit of work. See the module docs for the
/// read/write/commit protocol.
///
/// Operations are lifetime-free: they hold an `Arc` to the store and cheap
/// clones of the lock services, so a [`crate::transaction::Transaction`]
/// built on one can be parked in a registry between client calls.
pub struct AtomicOperation {
    store: Arc<BufferedStore>,
    locks: LockService,
    ranges: RangeLockService,
    owner: u64,
    state: AtomicState,
    pending: Vec<CWrite>,
    expectations: Vec<VersionExpectation>,
    // Lock intents, recorded while OPEN and acquired together at commit.
    // Tokens sort canonically so concurrent committers acquire in the same
    // order.
    token_intents: BTreeSet<Token>,
    read_intents: Vec<(Key, Extent)>,
    write_intents: Vec<(Key, Extent)>,
    // Guards held from commit-time acquisition until the operation drops.
    token_guards: Vec<WriteGuard>,
    range_guards: Vec<RangeGuard>,
}

impl AtomicOperation {
    pub(crate) fn new(store: Arc<BufferedStore>, locks: LockService, ranges: RangeLockService) -> Self {
        let owner = ranges.mint_owner();
        AtomicOperation {
            store,
            locks,
            ranges,
            owner,
            state: AtomicState::Open,
            pending: Vec::new(),
            expectations: Vec::new(),
            token_intents: BTreeSet::new(),
            read_intents: Vec::new(),
            write_intents: Vec::new(),
            token_guards: Vec::new(),
            range_guards: Vec::new(),
        }
    }

    /// The operation's current state.
    pub fn state(&self) -> AtomicState {
        self.state
    }

    /// Number of Writes buffered so far; the committer reserves this many
    /// consecutive versions before calling [`AtomicOperation::commit`].
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn require_open(&self) -> Result<()> {
        if self.state == AtomicState::Open {
            Ok(())
        } else {
            Err(ConcourseError::AtomicState(format!(
                "operation is {:?}, not OPEN",
                self.state
            )))
        }
    }

    fn record_expectation(&mut self, key: &Key, record: Option<Record>) {
        let observed = self.store.current_version(key, record);
        self.expectations.push(VersionExpectation {
            key: key.clone(),
            record,
            observed,
        });
    }

    fn intend_read(&mut self, key: &Key, extent: Extent) {
        self.read_intents.push((key.clone(), extent));
    }

    /// This operation's view of the store: committed Writes plus its own
    /// not-yet-applied buffered Writes, the latter stamped with synthetic
    /// versions above every committed one so they sort last and "win" the
    /// parity computation the way a read-your-own-writes caller expects.
    fn view(&self) -> Vec<CWrite> {
        let mut writes = self.store.snapshot();
        let mut next = writes.iter().map(|w| w.version).max().unwrap_or(0) + 1;
        for w in &self.pending {
            let mut stamped = w.clone();
            stamped.version = next;
            next += 1;
            writes.push(stamped);
        }
        writes
    }

    /// Whether `value` is live at `(key, record)`, per this operation's view.
    pub fn verify(&mut self, key: &Key, value: &Value, record: Record) -> Result<bool> {
        self.require_open()?;
        self.intend_read(key, Extent::point(value.clone()));
        self.record_expectation(key, Some(record));
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::verify(&refs, key.as_str(), value, record, None))
    }

    /// The live value set for `(key, record)`, per this operation's view.
    pub fn select(&mut self, key: &Key, record: Record) -> Result<Vec<Value>> {
        self.require_open()?;
        self.intend_read(key, Extent::full());
        self.record_expectation(key, Some(record));
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::select(&refs, key.as_str(), record, None))
    }

    /// Every key on `record` mapped to its live value set, per this
    /// operation's view. Every key the record currently carries is read-
    /// locked at commit and expectation-checked.
    pub fn select_record(&mut self, record: Record) -> Result<BTreeMap<String, Vec<Value>>> {
        self.require_open()?;
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        let by_key = replay::select_record(&refs, record, None);
        for key_name in by_key.keys() {
            let key = Key::new(key_name.clone())?;
            self.intend_read(&key, Extent::full());
            self.record_expectation(&key, Some(record));
        }
        Ok(by_key)
    }

    /// The keys on `record` with at least one live value, per this
    /// operation's view.
    pub fn describe(&mut self, record: Record) -> Result<BTreeSet<String>> {
        Ok(self.select_record(record)?.into_keys().collect())
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&mut self, key: &Key) -> Result<BTreeMap<Value, BTreeSet<Record>>> {
        self.require_open()?;
        self.intend_read(key, Extent::full());
        self.record_expectation(key, None);
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::browse(&refs, key.as_str(), None))
    }

    /// Records for which `key`'s live value set matches `op`/`values`.
    pub fn find(&mut self, key: &Key, op: Operator, values: &[Value]) -> Result<BTreeSet<Record>> {
        self.require_open()?;
        self.intend_read(key, Extent::for_operator(op, values));
        self.record_expectation(key, None);
        if matches!(op, Operator::Regex | Operator::NotRegex) {
            let browsed = self.browse(key)?;
            let pattern = match values {
                [Value::String(s)] | [Value::Tag(s)] => s.as_str(),
                _ => {
                    return Err(ConcourseError::InvalidArgument(
                        "regex operators take exactly one string operand".into(),
                    ))
                }
            };
            return concourse_storage::regex_match::find_regex(&browsed, op, pattern);
        }
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::find(&refs, key.as_str(), op, values, None))
    }

    /// Every key under which some record holds a live link to `target`,
    /// mapped to those records, per this operation's view. Each involved
    /// key is read-locked at commit and expectation-recorded like any
    /// other read.
    pub fn incoming_links(&mut self, target: Record) -> Result<BTreeMap<String, BTreeSet<Record>>> {
        self.require_open()?;
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        let links = replay::incoming_links(&refs, target, None);
        for key_name in links.keys() {
            let key = Key::new(key_name.clone())?;
            self.intend_read(&key, Extent::full());
            self.record_expectation(&key, None);
        }
        Ok(links)
    }

    /// Records whose live String value at `key` contains `query`'s tokens
    /// contiguously, per this operation's view.
    pub fn search(&mut self, key: &Key, query: &str) -> Result<BTreeSet<Record>> {
        self.require_open()?;
        let browsed = self.browse(key)?;
        Ok(concourse_storage::search::find_matches(&browsed, query))
    }

    /// The live value set after each Write to `(key, record)` with
    /// `start <= version < end`, per this operation's view.
    pub fn chronologize(&mut self, key: &Key, record: Record, start: u64, end: u64) -> Result<Vec<replay::ChronologizeEntry>> {
        self.require_open()?;
        self.intend_read(key, Extent::full());
        self.record_expectation(key, Some(record));
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::chronologize(&refs, key.as_str(), record, start, end))
    }

    /// A version-ordered audit trail for `record`, optionally filtered to
    /// `key`, per this operation's view.
    pub fn review(&mut self, record: Record, key: Option<&Key>) -> Result<Vec<(u64, String)>> {
        self.require_open()?;
        if let Some(key) = key {
            self.intend_read(key, Extent::full());
            self.record_expectation(key, Some(record));
        }
        let writes = self.view();
        let refs: Vec<&CWrite> = writes.iter().collect();
        Ok(replay::review(&refs, record, key.map(Key::as_str)))
    }

    fn buffer_write(&mut self, kind: WriteType, key: Key, value: Value, record: Record) {
        let value_bytes = value_token_bytes(&value);
        self.token_intents.insert(Token::point(key.as_str(), &value_bytes, record.id()));
        self.write_intents.push((key.clone(), Extent::point(value.clone())));
        self.pending.push(CWrite::new(kind, key, value, record, 0));
    }

    /// Adds `value` to `(key, record)` if it is not already live. Returns
    /// `false` without buffering a write when the precondition fails
    /// (invariant: a value can only be added if it is not currently live).
    pub fn add(&mut self, key: Key, value: Value, record: Record) -> Result<bool> {
        self.require_open()?;
        if let Value::Link(target) = value {
            if target == record {
                return Err(ConcourseError::InvalidArgument(format!(
                    "record {record} cannot link to itself"
                )));
            }
        }
        if self.verify(&key, &value, record)? {
            return Ok(false);
        }
        self.buffer_write(WriteType::Add, key, value, record);
        Ok(true)
    }

    /// Removes `value` from `(key, record)` if it is currently live.
    pub fn remove(&mut self, key: Key, value: Value, record: Record) -> Result<bool> {
        self.require_open()?;
        if !self.verify(&key, &value, record)? {
            return Ok(false);
        }
        self.buffer_write(WriteType::Remove, key, value, record);
        Ok(true)
    }

    /// Replaces `(key, record)`'s entire live value set with `{value}`:
    /// removes every currently live value, then adds `value`.
    pub fn set(&mut self, key: Key, value: Value, record: Record) -> Result<()> {
        self.require_open()?;
        for existing in self.select(&key, record)? {
            if existing != value {
                self.remove(key.clone(), existing, record)?;
            }
        }
        self.add(key, value, record)?;
        Ok(())
    }

    /// Acquires every intended lock: token write locks first, in canonical
    /// (sorted) order, then range write locks, then range read locks. Any
    /// wait that outlives [`LOCK_TIMEOUT`] fails the operation with the
    /// retry error.
    fn acquire_locks(&mut self) -> Result<()> {
        let tokens: Vec<Token> = self.token_intents.iter().copied().collect();
        for token in tokens {
            match self.locks.write_lock_timeout(token, LOCK_TIMEOUT) {
                Some(guard) => self.token_guards.push(guard),
                None => return Err(self.fail_retry()),
            }
        }
        for (key, extent) in std::mem::take(&mut self.write_intents) {
            match self.ranges.write_lock_timeout(key.as_str(), extent, self.owner, LOCK_TIMEOUT) {
                Some(guard) => self.range_guards.push(guard),
                None => return Err(self.fail_retry()),
            }
        }
        for (key, extent) in std::mem::take(&mut self.read_intents) {
            match self.ranges.read_lock_timeout(key.as_str(), extent, self.owner, LOCK_TIMEOUT) {
                Some(guard) => self.range_guards.push(guard),
                None => return Err(self.fail_retry()),
            }
        }
        Ok(())
    }

    /// Transitions to FAILED, releasing any locks already acquired, and
    /// hands back the retry error for the caller to return.
    fn fail_retry(&mut self) -> ConcourseError {
        self.state = AtomicState::Failed;
        self.token_guards.clear();
        self.range_guards.clear();
        ConcourseError::retry()
    }

    /// Validates every recorded expectation, mints versions for the
    /// buffered Writes starting at `next_version`, and appends them to the
    /// store. Returns the committed Writes' final versions on success.
    pub fn commit(mut self, next_version: u64) -> Result<Vec<u64>> {
        let staged = self.validate_and_stage(next_version)?;
        self.apply_staged(staged)
    }

    /// Drops buffered writes and releases every lock without applying
    /// anything.
    pub fn abort(&mut self) {
        self.pending.clear();
        self.state = AtomicState::Aborted;
    }

    /// Acquires the operation's full lock set, validates every recorded
    /// expectation, and mints versions for the buffered Writes, without
    /// applying them. A [`crate::transaction::Transaction`] calls this,
    /// durably stages the result in its intent log, and only then calls
    /// [`AtomicOperation::apply_staged`].
    pub(crate) fn validate_and_stage(&mut self, next_version: u64) -> Result<Vec<CWrite>> {
        self.require_open()?;
        self.state = AtomicState::Committing;

        self.acquire_locks()?;

        let stale = self.expectations.iter().any(|expectation| {
            self.store.current_version(&expectation.key, expectation.record) != expectation.observed
        });
        if stale {
            return Err(self.fail_retry());
        }

        let mut version = next_version;
        let mut staged = Vec::with_capacity(self.pending.len());
        for write in self.pending.drain(..) {
            let mut stamped = write;
            stamped.version = version;
            version += 1;
            staged.push(stamped);
        }
        Ok(staged)
    }

    /// Appends already-validated, version-stamped Writes to the store and
    /// marks this operation committed. The commit locks are still held, so
    /// the appends are atomic with respect to every other committer.
    pub(crate) fn apply_staged(&mut self, staged: Vec<CWrite>) -> Result<Vec<u64>> {
        let mut versions = Vec::with_capacity(staged.len());
        for write in staged {
            versions.push(write.version);
            self.store.insert(write)?;
        }
        self.state = AtomicState::Committed;
        Ok(versions)
    }

    /// Marks this operation failed without applying anything, for a caller
    /// (e.g. a transaction whose intent log write failed) that validated
    /// successfully but cannot proceed to apply.
    pub(crate) fn mark_failed(&mut self) {
        self.state = AtomicState::Failed;
    }
}

/// Runs `f` against a fresh [`AtomicOperation`], commits, and retries (with
/// exponential backoff and jitter, capped at 16 attempts) on
/// [`ConcourseError::is_retry`]. `reserve_versions` is called with the
/// number of buffered Writes and must hand back the first of that many
/// consecutive unused versions. `f`'s return value is discarded; use
/// [`supply_with_retry`] to get a value back out.
pub fn execute_with_retry<F>(
    store: &Arc<BufferedStore>,
    locks: &LockService,
    ranges: &RangeLockService,
    reserve_versions: impl Fn(u64) -> u64,
    mut f: F,
) -> Result<()>
where
    F: FnMut(&mut AtomicOperation) -> Result<()>,
{
    supply_with_retry(store, locks, ranges, reserve_versions, |op| f(op))
}

/// Like [`execute_with_retry`] but returns whatever `f` produces.
pub fn supply_with_retry<T, F>(
    store: &Arc<BufferedStore>,
    locks: &LockService,
    ranges: &RangeLockService,
    reserve_versions: impl Fn(u64) -> u64,
    mut f: F,
) -> Result<T>
where
    F: FnMut(&mut AtomicOperation) -> Result<T>,
{
    const MAX_ATTEMPTS: u32 = 16;
    let mut attempt = 0;
    loop {
        let mut op = AtomicOperation::new(store.clone(), locks.clone(), ranges.clone());
        let outcome = f(&mut op).and_then(|value| {
            let start = reserve_versions(op.pending_len() as u64);
            op.commit(start).map(|_| value)
        });
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retry() && attempt < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff_ms = 1u64 << attempt.min(10);
                let jitter_ms = rand::thread_rng().gen_range(0..backoff_ms.max(1));
                thread::sleep(Duration::from_millis(backoff_ms + jitter_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, Arc<BufferedStore>, LockService, RangeLockService) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BufferedStore::open(dir.path()).unwrap());
        (dir, store, LockService::new(), RangeLockService::new())
    }

    #[test]
    fn add_then_commit_is_visible() {
        let (_dir, store, locks, ranges) = harness();
        let mut op = AtomicOperation::new(store.clone(), locks, ranges);
        let key = Key::new("name").unwrap();
        assert!(op.add(key.clone(), Value::String("alice".into()), Record::new(1)).unwrap());
        op.commit(1).unwrap();
        assert!(store.verify(&key, &Value::String("alice".into()), Record::new(1), None));
    }

    #[test]
    fn adding_an_already_live_value_is_a_noop() {
        let (_dir, store, locks, ranges) = harness();
        let key = Key::new("name").unwrap();
        {
            let mut op = AtomicOperation::new(store.clone(), locks.clone(), ranges.clone());
            op.add(key.clone(), Value::String("alice".into()), Record::new(1)).unwrap();
            op.commit(1).unwrap();
        }
        let mut op = AtomicOperation::new(store, locks, ranges);
        assert!(!op.add(key, Value::String("alice".into()), Record::new(1)).unwrap());
    }

    #[test]
    fn self_link_is_rejected() {
        let (_dir, store, locks, ranges) = harness();
        let mut op = AtomicOperation::new(store, locks, ranges);
        let err = op
            .add(Key::new("parent").unwrap(), Value::Link(Record::new(9)), Record::new(9))
            .unwrap_err();
        assert!(matches!(err, ConcourseError::InvalidArgument(_)));
    }

    #[test]
    fn an_open_operation_holds_no_locks() {
        let (_dir, store, locks, ranges) = harness();
        let mut op = AtomicOperation::new(store.clone(), locks.clone(), ranges.clone());
        op.add(Key::new("k").unwrap(), Value::Int32(1), Record::new(1)).unwrap();
        // a second committer is free to slip in while the first is OPEN
        let mut other = AtomicOperation::new(store, locks, ranges);
        other.add(Key::new("k").unwrap(), Value::Int32(1), Record::new(1)).unwrap();
        other.commit(1).unwrap();
        // ...and the first then fails validation instead of blocking
        assert!(op.commit(2).unwrap_err().is_retry());
    }

    #[test]
    fn operations_on_a_finished_operation_are_rejected() {
        let (_dir, store, locks, ranges) = harness();
        let mut op = AtomicOperation::new(store, locks, ranges);
        let key = Key::new("k").unwrap();
        op.add(key.clone(), Value::Int32(1), Record::new(1)).unwrap();
        let staged = op.validate_and_stage(1).unwrap();
        op.apply_staged(staged).unwrap();
        assert!(matches!(
            op.select(&key, Record::new(1)),
            Err(ConcourseError::AtomicState(_))
        ));
    }

    #[test]
    fn concurrent_writer_invalidates_expectation_and_fails_commit() {
        let (_dir, store, locks, ranges) = harness();
        let key = Key::new("name").unwrap();

        let mut op = AtomicOperation::new(store.clone(), locks, ranges);
        op.select(&key, Record::new(1)).unwrap(); // records an expectation

        // a second, independent committer slips in a conflicting write
        store.insert(CWrite::new(WriteType::Add, key.clone(), Value::String("bob".into()), Record::new(1), 1)).unwrap();

        op.add(key, Value::String("alice".into()), Record::new(1)).unwrap();
        let err = op.commit(2).unwrap_err();
        assert!(err.is_retry());
    }

    #[test]
    fn set_replaces_the_live_value_set() {
        let (_dir, store, locks, ranges) = harness();
        let key = Key::new("name").unwrap();
        let record = Record::new(1);
        {
            let mut op = AtomicOperation::new(store.clone(), locks.clone(), ranges.clone());
            op.add(key.clone(), Value::String("alice".into()), record).unwrap();
            op.commit(1).unwrap();
        }
        {
            let mut op = AtomicOperation::new(store.clone(), locks, ranges);
            op.set(key.clone(), Value::String("bob".into()), record).unwrap();
            op.commit(2).unwrap();
        }
        assert!(!store.verify(&key, &Value::String("alice".into()), record, None));
        assert!(store.verify(&key, &Value::String("bob".into()), record, None));
    }

    #[test]
    fn select_record_sees_pending_writes() {
        let (_dir, store, locks, ranges) = harness();
        let mut op = AtomicOperation::new(store, locks, ranges);
        op.add(Key::new("name").unwrap(), Value::String("alice".into()), Record::new(3)).unwrap();
        op.add(Key::new("age").unwrap(), Value::Int32(30), Record::new(3)).unwrap();
        let by_key = op.select_record(Record::new(3)).unwrap();
        assert_eq!(by_key.len(), 2);
        assert_eq!(op.describe(Record::new(3)).unwrap().len(), 2);
    }

    #[test]
    fn execute_with_retry_eventually_succeeds() {
        let (_dir, store, locks, ranges) = harness();
        let key = Key::new("name").unwrap();
        let next = std::sync::atomic::AtomicU64::new(1);
        let result = supply_with_retry(&store, &locks, &ranges, |n| next.fetch_add(n, std::sync::atomic::Ordering::SeqCst), |op| {
            op.add(key.clone(), Value::String("alice".into()), Record::new(1))
        });
        assert!(result.unwrap());
    }
}
