//! The on-disk `<transaction-id>.intent` file: a length-framed sequence of
//! [`IntentEntry`] records, written the same way a Buffer page frames
//! Writes -- a 4-byte big-endian length prefix protects against a crash
//! truncating a record mid-write.

use crate::intent::IntentEntry;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use concourse_core::{ConcourseError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write as IoWrite};
use std::path::{Path, PathBuf};

fn frame(entry: &IntentEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(entry).map_err(|e| ConcourseError::MalformedWrite(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.write_u32::<BigEndian>(body.len() as u32).unwrap();
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes as many complete `[len][entry]` frames as `bytes` holds,
/// stopping cleanly at the first incomplete or corrupt one (a crash
/// mid-append).
pub fn scan_frames(bytes: &[u8]) -> Vec<IntentEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        if pos + 4 + len > bytes.len() {
            break;
        }
        match bincode::deserialize::<IntentEntry>(&bytes[pos + 4..pos + 4 + len]) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        pos += 4 + len;
    }
    entries
}

/// A single transaction's open intent log file.
pub struct IntentLog {
    path: PathBuf,
    file: BufWriter<File>,
}

impl IntentLog {
    /// Creates `<dir>/<transaction_id>.intent` and writes its opening
    /// `Begin` entry.
    pub fn create(dir: &Path, transaction_id: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{transaction_id}.intent"));
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        let mut log = IntentLog { path, file: BufWriter::new(file) };
        log.append(&IntentEntry::Begin {
            transaction_id,
            timestamp: chrono::Utc::now().timestamp(),
        })?;
        Ok(log)
    }

    /// Appends one entry. Not durable until [`IntentLog::fsync`] is called.
    pub fn append(&mut self, entry: &IntentEntry) -> Result<()> {
        self.file.write_all(&frame(entry)?)?;
        Ok(())
    }

    /// Flushes and fsyncs the log. Must be called after appending `Commit`
    /// and before applying any staged Write -- that ordering is what makes
    /// recovery able to finish an interrupted commit.
    pub fn fsync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the log file. Safe once every staged Write has been applied
    /// (after a commit) or the transaction aborted without ever committing.
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// Reads and parses an intent log file without needing a live
/// [`IntentLog`] handle -- used by recovery at startup.
pub fn read_entries(path: &Path) -> Result<Vec<IntentEntry>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(scan_frames(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_fsync_and_read_back() {
        let dir = tempdir().unwrap();
        let mut log = IntentLog::create(dir.path(), 1).unwrap();
        log.append(&IntentEntry::Commit { transaction_id: 1 }).unwrap();
        log.fsync().unwrap();
        let path = log.path().to_path_buf();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].is_commit());
    }

    #[test]
    fn discard_removes_file() {
        let dir = tempdir().unwrap();
        let log = IntentLog::create(dir.path(), 2).unwrap();
        let path = log.path().to_path_buf();
        log.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn scan_frames_stops_at_truncated_record() {
        let dir = tempdir().unwrap();
        let mut log = IntentLog::create(dir.path(), 3).unwrap();
        log.fsync().unwrap();
        let path = log.path().to_path_buf();
        drop(log);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 40]);
        std::fs::write(&path, &bytes).unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
