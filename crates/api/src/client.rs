//! The embedded `Concourse` client: the operation surface a
//! request-routing server would call, bound to one environment of a
//! running [`Engine`].

use concourse_core::{replay, ConcourseError, Key, Operator, Record, Result, Value};
use concourse_engine::{Engine, Environment, Transaction};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::token::{AccessToken, TransactionToken};

/// An embedded Concourse client bound to one environment.
///
/// Mutations auto-commit through a retrying atomic operation; multi-step
/// callers open a transaction, receive a [`TransactionToken`], and route
/// the same operations through the token until `commit`/`abort`. The
/// client keeps the token -> transaction registry so callers stay handle-
/// free, the way the wire protocol needs them to be.
pub struct Concourse {
    engine: Arc<Engine>,
    env: Environment,
    access: AccessToken,
    // Seeded at the wall clock so fresh record ids stay unique across
    // restarts without a persisted counter.
    records: concourse_core::RecordCounter,
    transactions: DashMap<TransactionToken, Mutex<Option<Transaction>>>,
}

impl Concourse {
    /// Opens (or creates) an engine rooted at `path` and connects to its
    /// default environment.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let engine = Arc::new(Engine::open(path)?);
        Self::connect(engine, concourse_engine::DEFAULT_ENVIRONMENT)
    }

    /// Connects to one environment of an already-running engine. Several
    /// clients may share an engine, each bound to its own environment.
    pub fn connect(engine: Arc<Engine>, environment: &str) -> Result<Self> {
        let env = engine.environment(environment)?;
        let seed = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Ok(Concourse {
            engine,
            env,
            access: AccessToken::mint(),
            records: concourse_core::RecordCounter::starting_at(seed),
            transactions: DashMap::new(),
        })
    }

    /// The engine this client is connected to.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The environment this client operates on.
    pub fn environment(&self) -> &str {
        self.env.name()
    }

    /// Stops the underlying engine. Open transactions die with the client;
    /// none of them ever reached their durability point, so recovery
    /// discards them.
    pub fn close(self) -> Result<()> {
        self.engine.stop()
    }

    fn key(&self, key: &str) -> Result<Key> {
        Key::new(key)
    }

    // ------------------------------------------------------------------
    // Auto-committed mutations
    // ------------------------------------------------------------------

    /// Adds `value` to `(key, record)`; `false` if it was already live.
    pub fn add(&self, key: &str, value: Value, record: Record) -> Result<bool> {
        self.env.add(self.key(key)?, value, record)
    }

    /// Removes `value` from `(key, record)`; `false` if it was not live.
    pub fn remove(&self, key: &str, value: Value, record: Record) -> Result<bool> {
        self.env.remove(self.key(key)?, value, record)
    }

    /// Replaces `(key, record)`'s live value set with `{value}`.
    pub fn set(&self, key: &str, value: Value, record: Record) -> Result<()> {
        self.env.set(self.key(key)?, value, record)
    }

    // ------------------------------------------------------------------
    // Lookups (present-time and historical)
    // ------------------------------------------------------------------

    /// Whether `value` is live at `(key, record)`.
    pub fn verify(&self, key: &str, value: &Value, record: Record) -> Result<bool> {
        Ok(self.env.verify(&self.key(key)?, value, record, None))
    }

    /// [`Concourse::verify`] as of version `at`.
    pub fn verify_at(&self, key: &str, value: &Value, record: Record, at: u64) -> Result<bool> {
        Ok(self.env.verify(&self.key(key)?, value, record, Some(at)))
    }

    /// The live value set for `(key, record)`.
    pub fn select(&self, key: &str, record: Record) -> Result<Vec<Value>> {
        Ok(self.env.select(&self.key(key)?, record, None))
    }

    /// [`Concourse::select`] as of version `at`.
    pub fn select_at(&self, key: &str, record: Record, at: u64) -> Result<Vec<Value>> {
        Ok(self.env.select(&self.key(key)?, record, Some(at)))
    }

    /// Every key on `record` mapped to its live value set.
    pub fn select_record(&self, record: Record) -> Result<BTreeMap<String, Vec<Value>>> {
        self.env.select_record(record, None)
    }

    /// [`Concourse::select_record`] as of version `at`.
    pub fn select_record_at(&self, record: Record, at: u64) -> Result<BTreeMap<String, Vec<Value>>> {
        self.env.select_record(record, Some(at))
    }

    /// The keys on `record` with at least one live value.
    pub fn describe(&self, record: Record) -> Result<BTreeSet<String>> {
        self.env.describe(record, None)
    }

    /// [`Concourse::describe`] as of version `at`.
    pub fn describe_at(&self, record: Record, at: u64) -> Result<BTreeSet<String>> {
        self.env.describe(record, Some(at))
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&self, key: &str) -> Result<BTreeMap<Value, BTreeSet<Record>>> {
        Ok(self.env.browse(&self.key(key)?, None))
    }

    /// [`Concourse::browse`] as of version `at`.
    pub fn browse_at(&self, key: &str, at: u64) -> Result<BTreeMap<Value, BTreeSet<Record>>> {
        Ok(self.env.browse(&self.key(key)?, Some(at)))
    }

    /// Records for which `key`'s live value set matches `op`/`values`.
    pub fn find(&self, key: &str, op: Operator, values: &[Value]) -> Result<BTreeSet<Record>> {
        self.env.find(&self.key(key)?, op, values, None)
    }

    /// [`Concourse::find`] as of version `at`.
    pub fn find_at(&self, key: &str, op: Operator, values: &[Value], at: u64) -> Result<BTreeSet<Record>> {
        self.env.find(&self.key(key)?, op, values, Some(at))
    }

    /// Records whose live String value at `key` matches the search `query`.
    pub fn search(&self, key: &str, query: &str) -> Result<BTreeSet<Record>> {
        Ok(self.env.search(&self.key(key)?, query, None))
    }

    /// The live value set after each Write to `(key, record)` with
    /// `start <= version < end`.
    pub fn chronologize(&self, key: &str, record: Record, start: u64, end: u64) -> Result<Vec<replay::ChronologizeEntry>> {
        Ok(self.env.chronologize(&self.key(key)?, record, start, end))
    }

    /// A version-ordered audit trail for `record`, optionally filtered to
    /// one key.
    pub fn review(&self, record: Record, key: Option<&str>) -> Result<Vec<(u64, String)>> {
        let key = key.map(Key::new).transpose()?;
        Ok(self.env.review(record, key.as_ref()))
    }

    /// Every record this environment has ever seen a Write for.
    pub fn all_records(&self) -> BTreeSet<Record> {
        self.env.all_records()
    }

    /// Mints one unused version, usable as an `at` bound for later
    /// historical reads.
    pub fn time(&self) -> u64 {
        self.env.mint_version()
    }

    // ------------------------------------------------------------------
    // Compound operations
    // ------------------------------------------------------------------

    /// Finds the unique record where `value` is live at `key`, creating one
    /// (with the pair added) if none exists. More than one match is
    /// [`ConcourseError::DuplicateEntry`].
    pub fn find_or_add(&self, key: &str, value: Value) -> Result<Record> {
        let key = self.key(key)?;
        self.env.with_atomic(|op| {
            let matches = op.find(&key, Operator::Equals, std::slice::from_ref(&value))?;
            match matches.len() {
                0 => {
                    let record = self.records.next();
                    op.add(key.clone(), value.clone(), record)?;
                    Ok(record)
                }
                1 => Ok(*matches.iter().next().expect("len checked")),
                n => Err(ConcourseError::DuplicateEntry(format!(
                    "{n} records match {key} = {value}"
                ))),
            }
        })
    }

    /// Finds the unique record matching `(key, op, values)`, inserting
    /// `data` into a fresh record if none matches. More than one match is
    /// [`ConcourseError::DuplicateEntry`]. The whole operation is
    /// all-or-nothing.
    pub fn find_or_insert(
        &self,
        key: &str,
        op: Operator,
        values: &[Value],
        data: &[(String, Value)],
    ) -> Result<Record> {
        let key = self.key(key)?;
        let data: Vec<(Key, Value)> = data
            .iter()
            .map(|(k, v)| Ok((Key::new(k.clone())?, v.clone())))
            .collect::<Result<_>>()?;
        self.env.with_atomic(|atomic| {
            let matches = atomic.find(&key, op, values)?;
            match matches.len() {
                0 => {
                    let record = self.records.next();
                    for (k, v) in &data {
                        atomic.add(k.clone(), v.clone(), record)?;
                    }
                    Ok(record)
                }
                1 => Ok(*matches.iter().next().expect("len checked")),
                n => Err(ConcourseError::DuplicateEntry(format!(
                    "{n} records match {key} {op:?}"
                ))),
            }
        })
    }

    /// Re-points every link to `from` at `to`, copies `from`'s data onto
    /// `to`, and clears `from` -- all inside one atomic operation, so a
    /// failure at any step leaves both records untouched.
    pub fn consolidate_records(&self, from: Record, to: Record) -> Result<()> {
        if from == to {
            return Err(ConcourseError::InvalidArgument(
                "cannot consolidate a record into itself".into(),
            ));
        }
        self.env.with_atomic(|op| {
            // move the data
            for (key_name, values) in op.select_record(from)? {
                let key = Key::new(key_name)?;
                for value in values {
                    op.remove(key.clone(), value.clone(), from)?;
                    op.add(key.clone(), value, to)?;
                }
            }
            // re-point every incoming link at the surviving record; a link
            // held by the survivor itself would become a self-link, so it
            // is dropped rather than re-pointed
            for (key_name, inbound) in op.incoming_links(from)? {
                let key = Key::new(key_name)?;
                for record in inbound {
                    op.remove(key.clone(), Value::Link(from), record)?;
                    if record != to {
                        op.add(key.clone(), Value::Link(to), record)?;
                    }
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a durable transaction and registers it under a fresh token.
    pub fn start_transaction(&self) -> Result<TransactionToken> {
        let txn = self.env.start_transaction()?;
        let token = TransactionToken::mint(self.access);
        tracing::debug!(transaction = txn.id(), "transaction started");
        self.transactions.insert(token, Mutex::new(Some(txn)));
        Ok(token)
    }

    fn with_transaction<T>(
        &self,
        token: &TransactionToken,
        f: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        let entry = self.transactions.get(token).ok_or_else(|| {
            ConcourseError::TransactionState("transaction is not open".into())
        })?;
        let mut slot = entry.lock();
        let txn = slot.as_mut().ok_or_else(|| {
            ConcourseError::TransactionState("transaction already finished".into())
        })?;
        f(txn)
    }

    /// [`Concourse::add`] staged inside the transaction behind `token`.
    pub fn add_in(&self, token: &TransactionToken, key: &str, value: Value, record: Record) -> Result<bool> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.add(key, value, record))
    }

    /// [`Concourse::remove`] staged inside the transaction behind `token`.
    pub fn remove_in(&self, token: &TransactionToken, key: &str, value: Value, record: Record) -> Result<bool> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.remove(key, value, record))
    }

    /// [`Concourse::set`] staged inside the transaction behind `token`.
    pub fn set_in(&self, token: &TransactionToken, key: &str, value: Value, record: Record) -> Result<()> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.set(key, value, record))
    }

    /// [`Concourse::verify`] through the transaction's view.
    pub fn verify_in(&self, token: &TransactionToken, key: &str, value: &Value, record: Record) -> Result<bool> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.verify(&key, value, record))
    }

    /// [`Concourse::select`] through the transaction's view.
    pub fn select_in(&self, token: &TransactionToken, key: &str, record: Record) -> Result<Vec<Value>> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.select(&key, record))
    }

    /// [`Concourse::select_record`] through the transaction's view.
    pub fn select_record_in(&self, token: &TransactionToken, record: Record) -> Result<BTreeMap<String, Vec<Value>>> {
        self.with_transaction(token, |txn| txn.select_record(record))
    }

    /// [`Concourse::describe`] through the transaction's view.
    pub fn describe_in(&self, token: &TransactionToken, record: Record) -> Result<BTreeSet<String>> {
        self.with_transaction(token, |txn| txn.describe(record))
    }

    /// [`Concourse::browse`] through the transaction's view.
    pub fn browse_in(&self, token: &TransactionToken, key: &str) -> Result<BTreeMap<Value, BTreeSet<Record>>> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.browse(&key))
    }

    /// [`Concourse::find`] through the transaction's view.
    pub fn find_in(&self, token: &TransactionToken, key: &str, op: Operator, values: &[Value]) -> Result<BTreeSet<Record>> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.find(&key, op, values))
    }

    /// [`Concourse::search`] through the transaction's view.
    pub fn search_in(&self, token: &TransactionToken, key: &str, query: &str) -> Result<BTreeSet<Record>> {
        let key = self.key(key)?;
        self.with_transaction(token, |txn| txn.search(&key, query))
    }

    /// Commits the transaction behind `token`. `Ok(true)` on success;
    /// `Ok(false)` when a serialization conflict failed the commit (the
    /// transaction is gone either way). Unknown or finished tokens are
    /// [`ConcourseError::TransactionState`].
    pub fn commit(&self, token: &TransactionToken) -> Result<bool> {
        let (_, slot) = self.transactions.remove(token).ok_or_else(|| {
            ConcourseError::TransactionState("transaction is not open".into())
        })?;
        let txn = slot.into_inner().ok_or_else(|| {
            ConcourseError::TransactionState("transaction already finished".into())
        })?;
        match self.env.commit_transaction(txn) {
            Ok(versions) => {
                tracing::debug!(writes = versions.len(), "transaction committed");
                Ok(true)
            }
            Err(e) if e.is_retry() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Aborts the transaction behind `token`, discarding its staged writes
    /// and intent log.
    pub fn abort(&self, token: &TransactionToken) -> Result<()> {
        let (_, slot) = self.transactions.remove(token).ok_or_else(|| {
            ConcourseError::TransactionState("transaction is not open".into())
        })?;
        if let Some(txn) = slot.into_inner() {
            txn.abort();
        }
        Ok(())
    }
}

