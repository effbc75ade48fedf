//! The Engine: process-level storage lifecycle.
//!
//! One Engine owns every environment's [`BufferedStore`] and lock services,
//! the strictly monotonic version clock they all mint from, and the two
//! background threads (page transfer and group-commit fsync). Callers reach
//! storage through an [`Environment`] handle, which exposes the full
//! operation surface and vends [`AtomicOperation`]s and [`Transaction`]s.

use concourse_concurrency::{Extent, LockService, RangeLockService};
use concourse_core::{replay, ConcourseError, Key, Operator, Record, Result, Value};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::atomic::{execute_with_retry, supply_with_retry, AtomicOperation};
use crate::buffered_store::{BufferedStore, DEFAULT_TRANSFER_BUDGET_BYTES};
use crate::transaction::Transaction;

/// How often the transfer thread drains sealed pages into the Database.
pub const TRANSFER_INTERVAL: Duration = Duration::from_millis(100);

/// How often the group-commit thread fsyncs each environment's open page.
pub const GROUP_COMMIT_INTERVAL: Duration = Duration::from_millis(10);

/// Name of the environment used when callers do not pick one.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Mints globally unique, strictly ascending versions.
///
/// Seeded above both the highest recovered version and the wall clock in
/// microseconds, so versions double as coarse timestamps and never repeat
/// across restarts even if the clock steps backward.
pub struct VersionClock(AtomicU64);

impl VersionClock {
    fn seeded(recovered_max: u64) -> Self {
        let wall = chrono::Utc::now().timestamp_micros().max(0) as u64;
        VersionClock(AtomicU64::new(recovered_max.max(wall) + 1))
    }

    /// The next unused version.
    pub fn next(&self) -> u64 {
        self.reserve(1)
    }

    /// Reserves `n` consecutive versions and returns the first.
    pub fn reserve(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::SeqCst)
    }
}

/// An exclusive marker file over a storage directory.
///
/// The file records the owning process id. A live owner blocks a second
/// engine from opening the same directory; a marker left by a dead process
/// is evidence of an unclean shutdown, logged and taken over.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let holder: Option<u32> = contents.trim().parse().ok();
                if let Some(pid) = holder {
                    if pid != std::process::id() && Path::new(&format!("/proc/{pid}")).exists() {
                        return Err(ConcourseError::InvalidArgument(format!(
                            "{} is locked by running process {pid}",
                            path.display()
                        )));
                    }
                }
                tracing::warn!(path = %path.display(), "stale lock file from unclean shutdown; taking over");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(DirLock { path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct Env {
    name: String,
    store: Arc<BufferedStore>,
    locks: LockService,
    ranges: RangeLockService,
    intent_dir: PathBuf,
    next_txn_id: AtomicU64,
    _buffer_lock: DirLock,
    _db_lock: DirLock,
}

struct Shared {
    environments: DashMap<String, Arc<Env>>,
    stop: AtomicBool,
    // Nudged by committers so the transfer thread wakes before its tick.
    nudge: Mutex<()>,
    nudged: Condvar,
    transfer_budget: usize,
}

/// Tunable knobs for [`Engine::open`], in the builder style.
pub struct EngineBuilder {
    buffer_root: PathBuf,
    db_root: PathBuf,
    page_size_bytes: usize,
    transfer_interval: Duration,
    group_commit_interval: Duration,
    transfer_budget: usize,
}

impl EngineBuilder {
    /// Starts a builder with both storage roots under `root`
    /// (`<root>/buffer` and `<root>/db`).
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        EngineBuilder {
            buffer_root: root.join("buffer"),
            db_root: root.join("db"),
            page_size_bytes: concourse_storage::page::DEFAULT_PAGE_SIZE_BYTES,
            transfer_interval: TRANSFER_INTERVAL,
            group_commit_interval: GROUP_COMMIT_INTERVAL,
            transfer_budget: DEFAULT_TRANSFER_BUDGET_BYTES,
        }
    }

    /// Places Buffers under an explicit root.
    pub fn buffer_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.buffer_root = dir.as_ref().to_path_buf();
        self
    }

    /// Places Databases under an explicit root.
    pub fn db_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.db_root = dir.as_ref().to_path_buf();
        self
    }

    /// Overrides the Buffer page-size threshold (tests use small values to
    /// force rollover).
    pub fn page_size_bytes(mut self, bytes: usize) -> Self {
        self.page_size_bytes = bytes;
        self
    }

    /// Overrides the transfer tick.
    pub fn transfer_interval(mut self, interval: Duration) -> Self {
        self.transfer_interval = interval;
        self
    }

    /// Overrides the group-commit fsync tick.
    pub fn group_commit_interval(mut self, interval: Duration) -> Self {
        self.group_commit_interval = interval;
        self
    }

    /// Recovers on-disk state, replays orphaned intent logs, and starts the
    /// background threads.
    pub fn open(self) -> Result<Engine> {
        Engine::start(self)
    }
}

/// Top-level orchestrator over every environment's storage.
pub struct Engine {
    shared: Arc<Shared>,
    clock: Arc<VersionClock>,
    buffer_root: PathBuf,
    db_root: PathBuf,
    page_size_bytes: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Engine {
    /// Opens an Engine with default settings, storing under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        EngineBuilder::new(root).open()
    }

    /// Returns a builder for an Engine storing under `root`.
    pub fn builder(root: impl AsRef<Path>) -> EngineBuilder {
        EngineBuilder::new(root)
    }

    fn start(config: EngineBuilder) -> Result<Self> {
        std::fs::create_dir_all(&config.buffer_root)?;
        std::fs::create_dir_all(&config.db_root)?;

        let shared = Arc::new(Shared {
            environments: DashMap::new(),
            stop: AtomicBool::new(false),
            nudge: Mutex::new(()),
            nudged: Condvar::new(),
            transfer_budget: config.transfer_budget,
        });

        // Recover every environment already on disk before the clock is
        // seeded, so recovered versions bound it from below.
        let mut recovered_max = 0u64;
        let mut pending_replays = Vec::new();
        for entry in std::fs::read_dir(&config.buffer_root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let env = open_env(&config, &name)?;
            recovered_max = recovered_max.max(max_version_of(&env.store));
            pending_replays.push(env.clone());
            shared.environments.insert(name, env);
        }
        let clock = Arc::new(VersionClock::seeded(recovered_max));

        for env in pending_replays {
            replay_intent_logs(&env)?;
        }

        let engine = Engine {
            shared,
            clock,
            buffer_root: config.buffer_root,
            db_root: config.db_root,
            page_size_bytes: config.page_size_bytes,
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        };
        engine.spawn_background(config.transfer_interval, config.group_commit_interval);
        Ok(engine)
    }

    fn spawn_background(&self, transfer_interval: Duration, group_commit_interval: Duration) {
        let mut threads = self.threads.lock();

        let shared = self.shared.clone();
        threads.push(std::thread::spawn(move || {
            while !shared.stop.load(Ordering::SeqCst) {
                {
                    let mut guard = shared.nudge.lock();
                    shared.nudged.wait_for(&mut guard, transfer_interval);
                }
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                transfer_all(&shared);
            }
            // One draining pass so a clean shutdown leaves no sealed pages
            // behind.
            transfer_all(&shared);
        }));

        let shared = self.shared.clone();
        threads.push(std::thread::spawn(move || {
            while !shared.stop.load(Ordering::SeqCst) {
                std::thread::sleep(group_commit_interval);
                for env in shared.environments.iter() {
                    if let Err(e) = env.store.fsync() {
                        tracing::error!(environment = %env.name, error = %e, "group-commit fsync failed");
                    }
                }
            }
        }));
    }

    /// The environment named `name`, created (with its directories and
    /// locks) if it does not exist yet. Names follow the same rules as
    /// keys.
    pub fn environment(&self, name: &str) -> Result<Environment> {
        Key::new(name)?; // same character rules
        if let Some(env) = self.shared.environments.get(name) {
            return Ok(self.handle(env.clone()));
        }
        let config = EngineBuilder {
            buffer_root: self.buffer_root.clone(),
            db_root: self.db_root.clone(),
            page_size_bytes: self.page_size_bytes,
            transfer_interval: TRANSFER_INTERVAL,
            group_commit_interval: GROUP_COMMIT_INTERVAL,
            transfer_budget: self.shared.transfer_budget,
        };
        // Opening is fallible, so match the entry instead of or_insert_with;
        // holding the vacant entry keeps a racing caller from opening the
        // same directories (and their lock files) twice.
        let env = match self.shared.environments.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let env = open_env(&config, name)?;
                entry.insert(env.clone());
                env
            }
        };
        Ok(self.handle(env))
    }

    /// The default environment.
    pub fn default_environment(&self) -> Result<Environment> {
        self.environment(DEFAULT_ENVIRONMENT)
    }

    /// The names of every open environment.
    pub fn environment_names(&self) -> Vec<String> {
        self.shared.environments.iter().map(|e| e.name.clone()).collect()
    }

    fn handle(&self, env: Arc<Env>) -> Environment {
        Environment {
            env,
            clock: self.clock.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Mints one unused version.
    pub fn mint_version(&self) -> u64 {
        self.clock.next()
    }

    /// Test support: halts the process's view of this engine the way a
    /// crash would -- background threads stop, but nothing is flushed and
    /// the directory locks are left on disk. Recovery tests reopen the same
    /// directories afterward.
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.nudged.notify_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        // Leak the environments so DirLock::drop never runs, exactly as if
        // the process had died holding them.
        for entry in self.shared.environments.iter() {
            std::mem::forget(entry.value().clone());
        }
    }

    /// Stops the background threads (the transfer thread drains one more
    /// pass), fsyncs every open page, and releases the directory locks.
    /// Idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.nudged.notify_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        for env in self.shared.environments.iter() {
            env.store.fsync()?;
        }
        tracing::info!("engine stopped");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn open_env(config: &EngineBuilder, name: &str) -> Result<Arc<Env>> {
    let buffer_dir = config.buffer_root.join(name);
    let db_dir = config.db_root.join(name);
    std::fs::create_dir_all(&buffer_dir)?;
    std::fs::create_dir_all(&db_dir)?;

    let buffer_lock = DirLock::acquire(buffer_dir.join("buffer.lock"))?;
    let db_lock = DirLock::acquire(db_dir.join("db.lock"))?;

    let store = Arc::new(BufferedStore::open_at(&buffer_dir, &db_dir, config.page_size_bytes)?);
    tracing::info!(environment = name, "environment opened");
    Ok(Arc::new(Env {
        name: name.to_string(),
        store,
        locks: LockService::new(),
        ranges: RangeLockService::new(),
        intent_dir: buffer_dir.join("txn"),
        next_txn_id: AtomicU64::new(1),
        _buffer_lock: buffer_lock,
        _db_lock: db_lock,
    }))
}

fn max_version_of(store: &BufferedStore) -> u64 {
    store.snapshot().iter().map(|w| w.version).max().unwrap_or(0)
}

/// Replays intent logs a crash left behind: committed transactions get
/// their missing Writes re-inserted (presence is checked per version, so
/// replay is idempotent); everything else is discarded unapplied.
fn replay_intent_logs(env: &Env) -> Result<()> {
    for recovered in concourse_durability::scan(&env.intent_dir)? {
        if recovered.committed {
            let mut applied = 0usize;
            for write in &recovered.writes {
                if !env.store.contains_version(write.version) {
                    env.store.insert(write.clone())?;
                    applied += 1;
                }
            }
            env.store.fsync()?;
            tracing::warn!(
                environment = %env.name,
                transaction = recovered.transaction_id,
                applied,
                "finished interrupted transaction commit"
            );
        } else {
            tracing::warn!(
                environment = %env.name,
                transaction = recovered.transaction_id,
                "discarding uncommitted transaction intent"
            );
        }
        concourse_durability::discard(&recovered)?;
    }
    Ok(())
}

fn transfer_all(shared: &Shared) {
    for env in shared.environments.iter() {
        match env.store.transfer(shared.transfer_budget) {
            Ok(0) => {}
            Ok(count) => tracing::debug!(environment = %env.name, writes = count, "transferred sealed pages"),
            Err(e) => tracing::error!(environment = %env.name, error = %e, "transfer failed"),
        }
    }
}

/// A caller's handle onto one environment: the full operation surface of
/// the storage engine, backed by the engine's clock and lock services.
#[derive(Clone)]
pub struct Environment {
    env: Arc<Env>,
    clock: Arc<VersionClock>,
    shared: Arc<Shared>,
}

impl Environment {
    /// This environment's name.
    pub fn name(&self) -> &str {
        &self.env.name
    }

    fn reserve(&self) -> impl Fn(u64) -> u64 + '_ {
        let clock = self.clock.clone();
        move |n| clock.reserve(n)
    }

    fn after_commit(&self) -> Result<()> {
        self.env.store.fsync()?;
        self.shared.nudged.notify_all();
        Ok(())
    }

    /// Adds `value` to `(key, record)`; `false` if it was already live.
    pub fn add(&self, key: Key, value: Value, record: Record) -> Result<bool> {
        let added = supply_with_retry(&self.env.store, &self.env.locks, &self.env.ranges, self.reserve(), |op| {
            op.add(key.clone(), value.clone(), record)
        })?;
        self.after_commit()?;
        Ok(added)
    }

    /// Removes `value` from `(key, record)`; `false` if it was not live.
    pub fn remove(&self, key: Key, value: Value, record: Record) -> Result<bool> {
        let removed = supply_with_retry(&self.env.store, &self.env.locks, &self.env.ranges, self.reserve(), |op| {
            op.remove(key.clone(), value.clone(), record)
        })?;
        self.after_commit()?;
        Ok(removed)
    }

    /// Replaces `(key, record)`'s live value set with `{value}`.
    pub fn set(&self, key: Key, value: Value, record: Record) -> Result<()> {
        execute_with_retry(&self.env.store, &self.env.locks, &self.env.ranges, self.reserve(), |op| {
            op.set(key.clone(), value.clone(), record)
        })?;
        self.after_commit()
    }

    /// Whether `value` is live at `(key, record)`, now or at `at`.
    pub fn verify(&self, key: &Key, value: &Value, record: Record, at: Option<u64>) -> bool {
        let _guard = self.read_guard_if_now(key, Extent::point(value.clone()), at);
        self.env.store.verify(key, value, record, at)
    }

    /// The live value set for `(key, record)`, now or at `at`.
    pub fn select(&self, key: &Key, record: Record, at: Option<u64>) -> Vec<Value> {
        let _guard = self.read_guard_if_now(key, Extent::full(), at);
        self.env.store.select(key, record, at)
    }

    /// Every key on `record` mapped to its live value set. A present-time
    /// read spans multiple resources, so it runs inside an internal atomic
    /// operation; if that cannot win a consistent snapshot the read fails
    /// with [`ConcourseError::InsufficientAtomicity`].
    pub fn select_record(&self, record: Record, at: Option<u64>) -> Result<BTreeMap<String, Vec<Value>>> {
        match at {
            Some(t) => Ok(self.env.store.select_record(record, Some(t))),
            None => self.snapshot_read(|op| op.select_record(record)),
        }
    }

    /// The keys on `record` with at least one live value.
    pub fn describe(&self, record: Record, at: Option<u64>) -> Result<BTreeSet<String>> {
        match at {
            Some(t) => Ok(self.env.store.describe(record, Some(t))),
            None => self.snapshot_read(|op| op.describe(record)),
        }
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&self, key: &Key, at: Option<u64>) -> BTreeMap<Value, BTreeSet<Record>> {
        let _guard = self.read_guard_if_now(key, Extent::full(), at);
        self.env.store.browse(key, at)
    }

    /// Records for which `key`'s live value set matches `op`/`values`.
    pub fn find(&self, key: &Key, op: Operator, values: &[Value], at: Option<u64>) -> Result<BTreeSet<Record>> {
        let _guard = self.read_guard_if_now(key, Extent::for_operator(op, values), at);
        self.env.store.find(key, op, values, at)
    }

    /// Records whose live String value at `key` matches the search `query`.
    pub fn search(&self, key: &Key, query: &str, at: Option<u64>) -> BTreeSet<Record> {
        let _guard = self.read_guard_if_now(key, Extent::full(), at);
        self.env.store.search(key, query, at)
    }

    /// The live value set after each Write to `(key, record)` with
    /// `start <= version < end`.
    pub fn chronologize(&self, key: &Key, record: Record, start: u64, end: u64) -> Vec<replay::ChronologizeEntry> {
        self.env.store.chronologize(key, record, start, end)
    }

    /// A version-ordered audit trail for `record`, optionally filtered to
    /// `key`.
    pub fn review(&self, record: Record, key: Option<&Key>) -> Vec<(u64, String)> {
        self.env.store.review(record, key)
    }

    /// Every record this environment has ever seen a Write for.
    pub fn all_records(&self) -> BTreeSet<Record> {
        self.env.store.all_records()
    }

    /// Mints one unused version from the engine-wide clock.
    pub fn mint_version(&self) -> u64 {
        self.clock.next()
    }

    /// Opens a raw atomic operation for callers composing their own
    /// sequences; finish it with [`Environment::commit_atomic`] or
    /// [`AtomicOperation::abort`].
    pub fn start_atomic(&self) -> AtomicOperation {
        AtomicOperation::new(self.env.store.clone(), self.env.locks.clone(), self.env.ranges.clone())
    }

    /// Commits an atomic operation opened by [`Environment::start_atomic`],
    /// reserving its versions from the engine clock. Returns the committed
    /// versions.
    pub fn commit_atomic(&self, op: AtomicOperation) -> Result<Vec<u64>> {
        let start = self.clock.reserve(op.pending_len() as u64);
        let versions = op.commit(start)?;
        self.after_commit()?;
        Ok(versions)
    }

    /// Opens a durable transaction whose intent log lives in this
    /// environment's `txn/` directory.
    pub fn start_transaction(&self) -> Result<Transaction> {
        let id = self.env.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction::open(
            id,
            &self.env.intent_dir,
            self.env.store.clone(),
            self.env.locks.clone(),
            self.env.ranges.clone(),
        )
    }

    /// Commits a transaction opened by [`Environment::start_transaction`].
    pub fn commit_transaction(&self, txn: Transaction) -> Result<Vec<u64>> {
        let start = self.clock.reserve(txn.pending_len() as u64);
        let versions = txn.commit(start)?;
        self.after_commit()?;
        Ok(versions)
    }

    /// Runs `f` in a retrying atomic operation and commits, for callers
    /// composing multi-step logic (`find_or_add` and friends).
    pub fn with_atomic<T>(&self, f: impl FnMut(&mut AtomicOperation) -> Result<T>) -> Result<T> {
        let result = supply_with_retry(&self.env.store, &self.env.locks, &self.env.ranges, self.reserve(), f)?;
        self.after_commit()?;
        Ok(result)
    }

    fn snapshot_read<T>(&self, mut f: impl FnMut(&mut AtomicOperation) -> Result<T>) -> Result<T> {
        match supply_with_retry(&self.env.store, &self.env.locks, &self.env.ranges, self.reserve(), |op| f(op)) {
            Ok(value) => Ok(value),
            Err(e) if e.is_retry() => Err(ConcourseError::InsufficientAtomicity(
                "could not obtain a consistent multi-resource snapshot; retry inside a transaction".into(),
            )),
            Err(e) => Err(e),
        }
    }

    fn read_guard_if_now(
        &self,
        key: &Key,
        extent: Extent,
        at: Option<u64>,
    ) -> Option<concourse_concurrency::RangeGuard> {
        // Historical reads never conflict with writers; only a present-time
        // read must wait out an in-flight committer.
        match at {
            Some(_) => None,
            None => Some(self.env.ranges.read_lock(key.as_str(), extent, self.env.ranges.mint_owner())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(s: &str) -> Key {
        Key::new(s).unwrap()
    }

    #[test]
    fn add_select_round_trips_through_the_engine() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let env = engine.default_environment().unwrap();

        assert!(env.add(key("name"), Value::String("alice".into()), Record::new(1)).unwrap());
        assert!(!env.add(key("name"), Value::String("alice".into()), Record::new(1)).unwrap());
        assert_eq!(
            env.select(&key("name"), Record::new(1), None),
            vec![Value::String("alice".into())]
        );
        engine.stop().unwrap();
    }

    #[test]
    fn environments_are_isolated() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let a = engine.environment("tenant_a").unwrap();
        let b = engine.environment("tenant_b").unwrap();

        a.add(key("name"), Value::String("alice".into()), Record::new(1)).unwrap();
        assert!(b.select(&key("name"), Record::new(1), None).is_empty());
        engine.stop().unwrap();
    }

    #[test]
    fn invalid_environment_names_are_rejected() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        assert!(engine.environment("bad name").is_err());
        assert!(engine.environment("").is_err());
        engine.stop().unwrap();
    }

    #[test]
    fn versions_are_strictly_ascending_across_mints() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let mut last = 0;
        for _ in 0..1000 {
            let v = engine.mint_version();
            assert!(v > last);
            last = v;
        }
        engine.stop().unwrap();
    }

    #[test]
    fn data_survives_stop_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path()).unwrap();
            let env = engine.default_environment().unwrap();
            env.add(key("name"), Value::String("alice".into()), Record::new(1)).unwrap();
            engine.stop().unwrap();
        }
        let engine = Engine::open(dir.path()).unwrap();
        let env = engine.default_environment().unwrap();
        assert!(env.verify(&key("name"), &Value::String("alice".into()), Record::new(1), None));
        engine.stop().unwrap();
    }

    #[test]
    fn historical_reads_see_the_old_state() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let env = engine.default_environment().unwrap();

        env.add(key("age"), Value::Int32(30), Record::new(1)).unwrap();
        let before = engine.mint_version();
        env.remove(key("age"), Value::Int32(30), Record::new(1)).unwrap();
        env.add(key("age"), Value::Int32(31), Record::new(1)).unwrap();

        assert_eq!(env.select(&key("age"), Record::new(1), Some(before)), vec![Value::Int32(30)]);
        assert_eq!(env.select(&key("age"), Record::new(1), None), vec![Value::Int32(31)]);
        engine.stop().unwrap();
    }

    #[test]
    fn select_record_and_describe_cover_all_keys() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let env = engine.default_environment().unwrap();

        env.add(key("name"), Value::String("alice".into()), Record::new(1)).unwrap();
        env.add(key("age"), Value::Int32(30), Record::new(1)).unwrap();

        let by_key = env.select_record(Record::new(1), None).unwrap();
        assert_eq!(by_key.len(), 2);
        assert_eq!(
            env.describe(Record::new(1), None).unwrap(),
            BTreeSet::from(["age".to_string(), "name".to_string()])
        );
        engine.stop().unwrap();
    }
}
