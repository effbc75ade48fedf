//! The Database: the indexed, epoch-organized archive that sealed Buffer
//! pages are transferred into.
//!
//! Each transfer produces one epoch: a Primary block (sorted by record), a
//! Secondary block (sorted by key/value, the ordering `browse` and `find`
//! want), and a Search block (a sorted Secondary-style block restricted to
//! string/tag values, standing in for a tokenized inverted index). All
//! three blocks in an epoch hold the same Writes; queries here read the
//! Primary blocks as the single source of truth and consult Search only for
//! the regex/token path Primary can't serve on its own.

use crate::block::{Block, BlockKind};
use crate::regex_match::find_regex;
use concourse_core::{replay, ConcourseError, Key, Operator, Record, Result, Value, Write as CWrite};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

const MARKER_NAME: &str = "transfer.tmp";

struct Epoch {
    id: u64,
    primary: Block,
    #[allow(dead_code)]
    secondary: Block,
    search: Block,
}

struct Inner {
    epochs: Vec<Epoch>,
}

impl Inner {
    fn all_refs(&self) -> Vec<&CWrite> {
        self.epochs.iter().flat_map(|e| e.primary.writes().iter()).collect()
    }

    /// Only the string/tag-valued Writes, straight from the Search blocks.
    /// ADD and REMOVE of a string value are both string-valued Writes, so
    /// parity over this subset alone is correct for `search`.
    fn search_refs(&self) -> Vec<&CWrite> {
        self.epochs.iter().flat_map(|e| e.search.writes().iter()).collect()
    }
}

/// The sealed, indexed half of an environment's storage.
pub struct Database {
    root: PathBuf,
    inner: RwLock<Inner>,
}

impl Database {
    /// Opens (or creates) a Database rooted at `dir`, recovering any
    /// interrupted transfer left behind by a crash.
    pub fn open(dir: &Path) -> Result<Self> {
        for sub in ["primary", "secondary", "search"] {
            std::fs::create_dir_all(dir.join(sub))?;
        }
        recover_interrupted_transfer(dir)?;

        let mut epoch_ids: Vec<u64> = std::fs::read_dir(dir.join("primary"))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()))
            .collect();
        epoch_ids.sort_unstable();

        let mut epochs = Vec::new();
        for id in epoch_ids {
            let primary = Block::load(&dir.join("primary"), id, BlockKind::Primary)?;
            let secondary = Block::load(&dir.join("secondary"), id, BlockKind::Secondary)?;
            let search = Block::load(&dir.join("search"), id, BlockKind::Search)?;
            epochs.push(Epoch { id, primary, secondary, search });
        }

        Ok(Database {
            root: dir.to_path_buf(),
            inner: RwLock::new(Inner { epochs }),
        })
    }

    /// Ingests a batch of Writes (the contents of one or more sealed Buffer
    /// pages) as a new epoch, using the marker-file protocol: write a marker
    /// naming the epoch, build and fsync the three blocks, then delete the
    /// marker. A crash before the marker is deleted is detected and repaired
    /// on the next [`Database::open`] -- the caller only deletes the source
    /// pages once this call returns `Ok`.
    pub fn ingest(&self, epoch: u64, writes: Vec<CWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let marker = self.root.join(MARKER_NAME);
        std::fs::write(&marker, epoch.to_be_bytes())?;

        let search_writes: Vec<CWrite> = writes
            .iter()
            .filter(|w| matches!(w.value, Value::String(_) | Value::Tag(_)))
            .cloned()
            .collect();

        let primary = Block::build(&self.root.join("primary"), epoch, BlockKind::Primary, writes.clone())?;
        let secondary = Block::build(&self.root.join("secondary"), epoch, BlockKind::Secondary, writes)?;
        let search = Block::build(&self.root.join("search"), epoch, BlockKind::Search, search_writes)?;

        std::fs::remove_file(&marker)?;

        self.inner.write().epochs.push(Epoch { id: epoch, primary, secondary, search });
        Ok(())
    }

    /// The next unused epoch id (one past the highest currently present).
    pub fn next_epoch(&self) -> u64 {
        self.inner.read().epochs.last().map(|e| e.id + 1).unwrap_or(0)
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

    /// Records whose live String value at `key` contains `query`'s tokens
    /// contiguously, answered from the Search blocks.
    pub fn search(&self, key: &Key, query: &str, at: Option<u64>) -> BTreeSet<Record> {
        let inner = self.inner.read();
        let browsed = replay::browse(&inner.search_refs(), key.as_str(), at);
        crate::search::find_matches(&browsed, query)
    }

    /// Every live value for `key`, mapped to the records it is live on.
    pub fn browse(&self, key: &Key, at: Option<u64>) -> BTreeMap<Value, BTreeSet<Record>> {
        let inner = self.inner.read();
        replay::browse(&inner.all_refs(), key.as_str(), at)
    }

    /// Records for which `key`'s live value set matches `op`/`values`.
    pub fn find(&self, key: &Key, op: Operator, values: &[Value], at: Option<u64>) -> Result<BTreeSet<Record>> {
        if matches!(op, Operator::Regex | Operator::NotRegex) {
            let pattern = match values {
                [Value::String(s)] | [Value::Tag(s)] => s.as_str(),
                _ => {
                    return Err(ConcourseError::InvalidArgument(
                        "regex operators take exactly one string operand".into(),
                    ))
                }
            };
            let browsed = self.browse(key, at);
            return find_regex(&browsed, op, pattern);
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

    /// Every record this Database has ever seen a Write for.
    pub fn all_records(&self) -> BTreeSet<Record> {
        self.inner.read().all_refs().iter().map(|w| w.record).collect()
    }

    /// Number of epochs currently resident.
    pub fn epoch_count(&self) -> usize {
        self.inner.read().epochs.len()
    }

    /// Every Write currently resident across all epochs, cloned out from
    /// under the read lock. Used by `BufferedStore` to merge the Database's
    /// view with the Buffer's for queries that must see both.
    pub fn all_writes_cloned(&self) -> Vec<CWrite> {
        self.inner.read().all_refs().into_iter().cloned().collect()
    }
}

/// If a transfer was interrupted by a crash, finish or roll it back:
/// - If all three blocks for the marked epoch exist and load cleanly, the
///   transfer had actually completed and only the marker delete was lost;
///   just remove the marker.
/// - Otherwise the transfer never finished; delete whatever partial block
///   files exist for that epoch and the marker. The source pages are still
///   in the Buffer (it is never told to discard them until ingest returns
///   `Ok`), so the transfer will simply be retried.
fn recover_interrupted_transfer(dir: &Path) -> Result<()> {
    // A crash mid-build leaves .tmp files that never got their sealed name.
    for sub in ["primary", "secondary", "search"] {
        for entry in std::fs::read_dir(dir.join(sub))? {
            let path = entry?.path();
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                tracing::warn!(path = %path.display(), "sweeping unfinished block file");
                std::fs::remove_file(path)?;
            }
        }
    }

    let marker = dir.join(MARKER_NAME);
    let bytes = match std::fs::read(&marker) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() != 8 {
        std::fs::remove_file(&marker)?;
        return Ok(());
    }
    let epoch = u64::from_be_bytes(bytes.try_into().unwrap());

    let complete = ["primary", "secondary", "search"].iter().all(|sub| {
        let kind = match *sub {
            "primary" => BlockKind::Primary,
            "secondary" => BlockKind::Secondary,
            _ => BlockKind::Search,
        };
        Block::load(&dir.join(sub), epoch, kind).is_ok()
    });

    if !complete {
        for sub in ["primary", "secondary", "search"] {
            for ext in ["blk", "idx"] {
                let path = dir.join(sub).join(format!("{epoch}.{ext}"));
                let _ = std::fs::remove_file(path);
            }
        }
        tracing::warn!(epoch, "rolled back incomplete transfer after crash");
    } else {
        tracing::warn!(epoch, "completed transfer's marker survived a crash; removing it");
    }
    std::fs::remove_file(&marker)?;
    Ok(())
}
