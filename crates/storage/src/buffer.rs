//! The Buffer: an append-only, durable, unindexed log of Writes backed by a
//! sequence of [`Page`]s.
//!
//! The Buffer is Concourse's write path. Every mutation lands here first,
//! framed and fsynced, before it is visible to readers; only later does a
//! background transfer move sealed pages into the Database's indexed
//! blocks. Reads against the Buffer replay its Writes through
//! `concourse_core::replay` rather than maintaining their own live-value
//! bookkeeping.

use crate::page::{Page, DEFAULT_PAGE_SIZE_BYTES};
use concourse_core::{replay, Key, Operator, Record, Result, Value, Write as CWrite};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

struct SealedPage {
    path: PathBuf,
    writes: Vec<CWrite>,
}

struct Inner {
    sealed: VecDeque<SealedPage>,
    current: Page,
}

impl Inner {
    fn all_refs<'a>(&'a self) -> Vec<&'a CWrite> {
        let mut refs = Vec::new();
        for sp in &self.sealed {
            refs.extend(sp.writes.iter());
        }
        refs.extend(self.current.writes().iter());
        refs
    }
}

/// The durable write log for one environment.
pub struct Buffer {
    dir: PathBuf,
    page_size_bytes: usize,
    inner: RwLock<Inner>,
    // Serializes writers so page rollover is never raced, independent of
    // the finer-grained `inner` lock readers take.
    append_lock: Mutex<()>,
}

impl Buffer {
    /// Opens (or creates) a Buffer rooted at `dir`, recovering any sealed
    /// pages already present and the trailing open page.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_page_size(dir, DEFAULT_PAGE_SIZE_BYTES)
    }

    /// Like [`Buffer::open`] but with an explicit page-size threshold
    /// (primarily for tests that want to force rollover quickly).
    pub fn open_with_page_size(dir: &Path, page_size_bytes: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut sealed_paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|e| e == "bf").unwrap_or(false)
                    && p.file_stem().map(|s| s != "current").unwrap_or(false)
            })
            .collect();
        sealed_paths.sort_by_key(|p| first_version_of(p));

        let mut sealed = VecDeque::new();
        for path in sealed_paths {
            let writes = Page::load_sealed(&path)?;
            sealed.push_back(SealedPage { path, writes });
        }

        let current_path = dir.join(crate::page::CURRENT_PAGE_NAME);
        let current = if current_path.exists() {
            Page::recover_open(dir)?
        } else {
            Page::create_open(dir)?
        };

        Ok(Buffer {
            dir: dir.to_path_buf(),
            page_size_bytes,
            inner: RwLock::new(Inner { sealed, current }),
            append_lock: Mutex::new(()),
        })
    }

    /// Appends one Write, rolling the current page into a sealed one if the
    /// size threshold is crossed. The in-memory append happens under a brief
    /// write lock; the (slower) seal-and-rename happens outside it.
    pub fn insert(&self, write: CWrite) -> Result<()> {
        let _serialize = self.append_lock.lock();
        let rolled = {
            let mut inner = self.inner.write();
            inner.current.append(write)?;
            if inner.current.byte_len() >= self.page_size_bytes {
                let fresh = Page::create_open(&self.dir)?;
                Some(std::mem::replace(&mut inner.current, fresh))
            } else {
                None
            }
        };
        if let Some(mut finished) = rolled {
            let writes = finished.writes().to_vec();
            let path = finished.seal(&self.dir)?;
            self.inner.write().sealed.push_back(SealedPage { path, writes });
        }
        Ok(())
    }

    /// Fsyncs the current open page. Called periodically by a group-commit
    /// thread so acknowledged writes survive a crash.
    pub fn fsync(&self) -> Result<()> {
        self.inner.write().current.fsync()
    }

    /// Whether `value` is currently live at `(key, record)`.
    pub fn verify(&self, key: &Key, value: &Value, record: Record, at: Option<u64>) -> bool {
        let inner = self.inner.read();
        replay::verify(&inner.all_refs(), key.as_str(), value, record, at)
    }

    /// The live value set for `(key, record)`.
    pub fn select(&self, key: &Key, record: Record, at: Option<u64>) -> Vec<Value> {
        let inner = self.inner.read();
        replay::select(&inner.all_refs(), key.as_str(), record, at)
    }

    /// Every key on `record` mapped to its live value set.
    pub fn select_record(&self, record: Record, at: Option<u64>) -> BTreeMap<String, Vec<Value>> {
        let inner = self.inner.read();
        replay::select_record(&inner.all_refs(), record, at)
    }

    /// The keys on `record` with at least one live value.
    pub fn describe(&self, record: Record, at: Option<u64>) -> BTreeSet<String> {
        let inner = self.inner.read();
        replay::describe(&inner.all_refs(), record, at)
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&self, key: &Key, at: Option<u64>) -> BTreeMap<Value, BTreeSet<Record>> {
        let inner = self.inner.read();
        replay::browse(&inner.all_refs(), key.as_str(), at)
    }

    /// Records whose live String value at `key` contains `query`'s tokens
    /// contiguously.
    pub fn search(&self, key: &Key, query: &str, at: Option<u64>) -> BTreeSet<Record> {
        let browsed = self.browse(key, at);
        crate::search::find_matches(&browsed, query)
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
            return crate::regex_match::find_regex(&browsed, op, pattern);
        }
        let inner = self.inner.read();
        Ok(replay::find(&inner.all_refs(), key.as_str(), op, values, at))
    }

    /// The live value set after each Write to `(key, record)` with
    /// `start <= version < end`.
    pub fn chronologize(&self, key: &Key, record: Record, start: u64, end: u64) -> Vec<replay::ChronologizeEntry> {
        let inner = self.inner.read();
        replay::chronologize(&inner.all_refs(), key.as_str(), record, start, end)
    }

    /// A human-readable audit trail for `record`, optionally filtered to
    /// `key`.
    pub fn review(&self, record: Record, key: Option<&Key>) -> Vec<(u64, String)> {
        let inner = self.inner.read();
        replay::review(&inner.all_refs(), record, key.map(Key::as_str))
    }

    /// Every record ever written, with its set of keys that currently hold a
    /// live value.
    pub fn all_records(&self) -> BTreeSet<Record> {
        let inner = self.inner.read();
        inner.all_refs().iter().map(|w| w.record).collect()
    }

    /// Hands the oldest sealed pages (up to `max_bytes` of framed content)
    /// to the caller for transfer into the Database, without deleting their
    /// files. The caller must call [`Buffer::discard_pages`] only after the
    /// Database has durably ingested them.
    pub fn take_sealed(&self, max_bytes: usize) -> Vec<(PathBuf, Vec<CWrite>)> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut budget = max_bytes;
        for sp in &inner.sealed {
            let approx_size: usize = sp.writes.iter().map(|w| w.encode().len() + 4).sum();
            if !out.is_empty() && approx_size > budget {
                break;
            }
            budget = budget.saturating_sub(approx_size);
            out.push((sp.path.clone(), sp.writes.clone()));
        }
        out
    }

    /// Removes sealed pages at `paths` from the Buffer's bookkeeping and
    /// deletes their files. Only safe once the Database has fsynced the
    /// corresponding block.
    pub fn discard_pages(&self, paths: &[PathBuf]) -> Result<()> {
        let mut inner = self.inner.write();
        inner.sealed.retain(|sp| !paths.contains(&sp.path));
        drop(inner);
        for path in paths {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Number of sealed pages awaiting transfer.
    pub fn sealed_page_count(&self) -> usize {
        self.inner.read().sealed.len()
    }

    /// Every Write currently resident in the Buffer, cloned out from under
    /// the read lock. Used by `BufferedStore` to merge the Buffer's view
    /// with the Database's for queries that must see both.
    pub fn all_writes_cloned(&self) -> Vec<CWrite> {
        self.inner.read().all_refs().into_iter().cloned().collect()
    }
}

fn first_version_of(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::WriteType;
    use tempfile::tempdir;

    fn w(kind: WriteType, key: &str, value: &str, record: u64, version: u64) -> CWrite {
        CWrite::new(
            kind,
            Key::new(key).unwrap(),
            Value::String(value.into()),
            Record::new(record),
            version,
        )
    }

    #[test]
    fn insert_and_verify_round_trips() {
        let dir = tempdir().unwrap();
        let buffer = Buffer::open(dir.path()).unwrap();
        buffer
            .insert(w(WriteType::Add, "name", "alice", 1, 1))
            .unwrap();
        assert!(buffer.verify(&Key::new("name").unwrap(), &Value::String("alice".into()), Record::new(1), None));
    }

    #[test]
    fn add_then_remove_is_not_live() {
        let dir = tempdir().unwrap();
        let buffer = Buffer::open(dir.path()).unwrap();
        buffer.insert(w(WriteType::Add, "name", "alice", 1, 1)).unwrap();
        buffer.insert(w(WriteType::Remove, "name", "alice", 1, 2)).unwrap();
        assert!(!buffer.verify(&Key::new("name").unwrap(), &Value::String("alice".into()), Record::new(1), None));
    }

    #[test]
    fn rollover_seals_pages_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let small = 64; // force rollover almost immediately
        {
            let buffer = Buffer::open_with_page_size(dir.path(), small).unwrap();
            for i in 1..=20 {
                buffer.insert(w(WriteType::Add, "name", "alice", i, i)).unwrap();
            }
            assert!(buffer.sealed_page_count() > 0);
        }
        let reopened = Buffer::open_with_page_size(dir.path(), small).unwrap();
        for i in 1..=20 {
            assert!(reopened.verify(&Key::new("name").unwrap(), &Value::String("alice".into()), Record::new(i), None));
        }
    }

    #[test]
    fn take_sealed_then_discard_removes_files() {
        let dir = tempdir().unwrap();
        let buffer = Buffer::open_with_page_size(dir.path(), 16).unwrap();
        for i in 1..=10 {
            buffer.insert(w(WriteType::Add, "name", "alice", i, i)).unwrap();
        }
        let sealed_count = buffer.sealed_page_count();
        assert!(sealed_count > 0);
        let batch = buffer.take_sealed(usize::MAX);
        assert_eq!(batch.len(), sealed_count);
        let paths: Vec<PathBuf> = batch.iter().map(|(p, _)| p.clone()).collect();
        buffer.discard_pages(&paths).unwrap();
        assert_eq!(buffer.sealed_page_count(), 0);
        for path in &paths {
            assert!(!path.exists());
        }
    }
}
