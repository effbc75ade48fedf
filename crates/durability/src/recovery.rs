//! Startup recovery over a directory of `*.intent` files.
//!
//! Recovery's one job: decide, for each intent log left behind, whether the
//! transaction it describes reached `Commit` before the crash. Committed
//! transactions are handed back with their staged Writes so the caller can
//! re-apply any that didn't make it into a Buffer; everything else --
//! aborted, or never committed at all -- is reported so the caller can
//! discard it without applying anything.

use crate::intent::IntentEntry;
use crate::log;
use concourse_core::{Result, Write as CWrite};
use std::path::{Path, PathBuf};

/// One intent log found on disk, classified by whether it committed.
pub struct RecoveredTransaction {
    /// The transaction's identifier.
    pub transaction_id: u64,
    /// The backing `.intent` file, kept around so the caller can delete it
    /// once recovery has been fully applied.
    pub path: PathBuf,
    /// `true` if the log ends in a `Commit` entry.
    pub committed: bool,
    /// The Writes staged before the terminal entry, present only when
    /// `committed` is true (an uncommitted transaction's writes must never
    /// be applied).
    pub writes: Vec<CWrite>,
}

/// Scans `dir` for `*.intent` files and classifies each one. Does not
/// delete or otherwise mutate any file -- callers apply `writes` for
/// committed transactions first, then call [`discard`] once that has
/// durably happened.
pub fn scan(dir: &Path) -> Result<Vec<RecoveredTransaction>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut recovered = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e != "intent").unwrap_or(true) {
            continue;
        }
        let entries = log::read_entries(&path)?;
        let transaction_id = match entries.first() {
            Some(e) => e.transaction_id(),
            None => continue, // empty log from a crash before Begin was fsynced
        };
        let committed = entries.iter().any(IntentEntry::is_commit);
        let aborted = entries.iter().any(IntentEntry::is_abort);
        let writes = if committed && !aborted {
            entries
                .into_iter()
                .filter_map(|e| match e {
                    IntentEntry::Stage { write, .. } => Some(write),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };
        recovered.push(RecoveredTransaction {
            transaction_id,
            path,
            committed: committed && !aborted,
            writes,
        });
    }
    recovered.sort_by_key(|r| r.transaction_id);
    Ok(recovered)
}

/// Deletes a transaction's intent log once its recovery outcome (replay or
/// discard) has been durably applied.
pub fn discard(recovered: &RecoveredTransaction) -> Result<()> {
    match std::fs::remove_file(&recovered.path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::IntentLog;
    use concourse_core::{Key, Record, Value, WriteType};
    use tempfile::tempdir;

    fn staged_write() -> CWrite {
        CWrite::new(
            WriteType::Add,
            Key::new("name").unwrap(),
            Value::String("alice".into()),
            Record::new(1),
            5,
        )
    }

    #[test]
    fn committed_transaction_is_recovered_with_its_writes() {
        let dir = tempdir().unwrap();
        let mut log = IntentLog::create(dir.path(), 1).unwrap();
        log.append(&IntentEntry::Stage { transaction_id: 1, write: staged_write() }).unwrap();
        log.append(&IntentEntry::Commit { transaction_id: 1 }).unwrap();
        log.fsync().unwrap();

        let recovered = scan(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].committed);
        assert_eq!(recovered[0].writes.len(), 1);
    }

    #[test]
    fn uncommitted_transaction_has_no_writes_to_apply() {
        let dir = tempdir().unwrap();
        let mut log = IntentLog::create(dir.path(), 2).unwrap();
        log.append(&IntentEntry::Stage { transaction_id: 2, write: staged_write() }).unwrap();
        log.fsync().unwrap();

        let recovered = scan(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(!recovered[0].committed);
        assert!(recovered[0].writes.is_empty());
    }

    #[test]
    fn aborted_transaction_is_not_committed_even_with_a_commit_entry() {
        // a well-behaved engine never appends both, but recovery must not
        // replay writes if an abort shows up anywhere in the log
        let dir = tempdir().unwrap();
        let mut log = IntentLog::create(dir.path(), 3).unwrap();
        log.append(&IntentEntry::Stage { transaction_id: 3, write: staged_write() }).unwrap();
        log.append(&IntentEntry::Commit { transaction_id: 3 }).unwrap();
        log.append(&IntentEntry::Abort { transaction_id: 3 }).unwrap();
        log.fsync().unwrap();

        let recovered = scan(dir.path()).unwrap();
        assert!(!recovered[0].committed);
    }

    #[test]
    fn discard_removes_the_log_file() {
        let dir = tempdir().unwrap();
        let mut log = IntentLog::create(dir.path(), 4).unwrap();
        let path = log.path().to_path_buf();
        log.fsync().ok();
        drop(log);

        let recovered = scan(dir.path()).unwrap();
        discard(&recovered[0]).unwrap();
        assert!(!path.exists());
    }
}
