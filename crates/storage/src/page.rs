//! A sealed, ordered, length-framed sequence of Writes backed by a single
//! file.
//!
//! Each Write is stored as a 4-byte big-endian length prefix followed by
//! its canonical encoding. Framing (rather than relying on Write's own
//! internal lengths to delimit records) is what lets recovery detect a
//! page that was cut off mid-append by a crash: once a length prefix or
//! its payload runs past the end of the file, everything from there on is
//! discarded.

use crate::format::{FileHeader, FileKind, HEADER_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use concourse_core::{ConcourseError, Result, Write as CWrite};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};

/// Default byte threshold at which an open page is sealed.
pub const DEFAULT_PAGE_SIZE_BYTES: usize = 8 * 1024 * 1024;

/// Name of the always-open, unsealed page.
pub const CURRENT_PAGE_NAME: &str = "current.bf";

/// Encodes one length-framed Write record.
pub fn frame(write: &CWrite) -> Vec<u8> {
    let body = write.encode();
    let mut out = Vec::with_capacity(4 + body.len());
    out.write_u32::<BigEndian>(body.len() as u32).unwrap();
    out.extend_from_slice(&body);
    out
}

/// Scans a buffer of concatenated frames, decoding as many complete
/// `[len][write]` records as are present. Returns the decoded Writes and
/// the number of leading bytes that formed complete records -- any
/// trailing bytes are an incomplete (crash-truncated) record.
pub fn scan_frames(bytes: &[u8]) -> (Vec<CWrite>, usize) {
    let mut writes = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        if pos + 4 + len > bytes.len() {
            break; // truncated: the length prefix promised more than we have
        }
        match CWrite::decode(&bytes[pos + 4..pos + 4 + len]) {
            Ok(w) => writes.push(w),
            Err(_) => break, // corrupt record; stop at the last good boundary
        }
        pos += 4 + len;
    }
    (writes, pos)
}

/// An in-memory handle to a page: the Writes it holds, whether it has been
/// sealed, and the file backing it on disk.
pub struct Page {
    path: PathBuf,
    sealed: bool,
    first_version: Option<u64>,
    writes: Vec<CWrite>,
    frame_bytes: usize,
    file: Option<BufWriter<File>>,
}

impl Page {
    /// Creates a fresh, empty, open page at `<dir>/current.bf`.
    pub fn create_open(dir: &Path) -> Result<Self> {
        let path = dir.join(CURRENT_PAGE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&FileHeader::new(FileKind::Page, 0).encode())?;
        file.flush()?;
        Ok(Page {
            path,
            sealed: false,
            first_version: None,
            writes: Vec::new(),
            frame_bytes: 0,
            file: Some(BufWriter::new(file)),
        })
    }

    /// Recovers an open page from `<dir>/current.bf`, truncating any
    /// trailing bytes that do not form a complete Write (a crash mid-append).
    pub fn recover_open(dir: &Path) -> Result<Self> {
        let path = dir.join(CURRENT_PAGE_NAME);
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        let body = if bytes.len() >= HEADER_LEN {
            &bytes[HEADER_LEN..]
        } else {
            &[][..]
        };
        let (writes, good_len) = scan_frames(body);
        if HEADER_LEN + good_len != bytes.len() {
            tracing::warn!(
                path = %path.display(),
                discarded = bytes.len() - HEADER_LEN - good_len,
                "truncating page with incomplete trailing write"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len((HEADER_LEN + good_len) as u64)?;
        }
        let file = OpenOptions::new().write(true).append(true).open(&path)?;
        Ok(Page {
            path,
            sealed: false,
            first_version: writes.first().map(|w| w.version),
            frame_bytes: good_len,
            writes,
            file: Some(BufWriter::new(file)),
        })
    }

    /// Loads a sealed page's Writes from `path`.
    pub fn load_sealed(path: &Path) -> Result<Vec<CWrite>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let header = FileHeader::decode(&bytes)?;
        if header.kind != FileKind::Page {
            return Err(ConcourseError::CorruptBlock(format!(
                "{} is not a page file",
                path.display()
            )));
        }
        let (writes, good_len) = scan_frames(&bytes[HEADER_LEN..]);
        if HEADER_LEN + good_len != bytes.len() {
            return Err(ConcourseError::CorruptBlock(format!(
                "{} has a truncated trailing write",
                path.display()
            )));
        }
        Ok(writes)
    }

    /// Appends one Write: in-memory, and to the OS file cache. Durability
    /// (fsync) is the caller's responsibility -- see [`Page::fsync`].
    pub fn append(&mut self, write: CWrite) -> Result<()> {
        let framed = frame(&write);
        let file = self.file.as_mut().expect("open page always has a file");
        file.write_all(&framed)?;
        self.frame_bytes += framed.len();
        if self.first_version.is_none() {
            self.first_version = Some(write.version);
        }
        self.writes.push(write);
        Ok(())
    }

    /// Flushes buffered bytes into the OS file cache and fsyncs them to
    /// disk.
    pub fn fsync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// The number of framed bytes written so far (used against the page
    /// size threshold).
    pub fn byte_len(&self) -> usize {
        self.frame_bytes
    }

    /// The Writes currently held in this page.
    pub fn writes(&self) -> &[CWrite] {
        &self.writes
    }

    /// The version of the first Write appended, if any.
    pub fn first_version(&self) -> Option<u64> {
        self.first_version
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this page has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seals the page: fsyncs it, rewrites the header with the final
    /// count, and renames it from `current.bf` to `<first-version>.bf`.
    /// Returns the sealed path. A page with no Writes cannot be sealed.
    pub fn seal(&mut self, dir: &Path) -> Result<PathBuf> {
        let first_version = self.first_version.ok_or_else(|| {
            ConcourseError::InvalidArgument("cannot seal an empty page".into())
        })?;
        self.fsync()?;
        {
            let mut f = OpenOptions::new().write(true).open(&self.path)?;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&FileHeader::new(FileKind::Page, self.writes.len() as u64).encode())?;
            f.sync_all()?;
        }
        let sealed_path = dir.join(format!("{first_version}.bf"));
        std::fs::rename(&self.path, &sealed_path)?;
        self.sealed = true;
        self.path = sealed_path.clone();
        self.file = None;
        Ok(sealed_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concourse_core::{Key, Record, Value, Write as CWrite, WriteType};
    use tempfile::tempdir;

    fn w(version: u64) -> CWrite {
        CWrite::new(
            WriteType::Add,
            Key::new("name").unwrap(),
            Value::String("alice".into()),
            Record::new(1),
            version,
        )
    }

    #[test]
    fn append_and_seal_round_trips() {
        let dir = tempdir().unwrap();
        let mut page = Page::create_open(dir.path()).unwrap();
        page.append(w(1)).unwrap();
        page.append(w(2)).unwrap();
        let sealed_path = page.seal(dir.path()).unwrap();
        assert_eq!(sealed_path, dir.path().join("1.bf"));
        let loaded = Page::load_sealed(&sealed_path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].version, 1);
    }

    #[test]
    fn recovery_truncates_incomplete_trailing_write() {
        let dir = tempdir().unwrap();
        {
            let mut page = Page::create_open(dir.path()).unwrap();
            page.append(w(1)).unwrap();
            page.fsync().unwrap();
        }
        // simulate a crash mid-append: chop off the last few bytes of the
        // second, never-completed write.
        let path = dir.path().join(CURRENT_PAGE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 50]); // a length prefix promising 50 more bytes
        std::fs::write(&path, &bytes).unwrap();

        let recovered = Page::recover_open(dir.path()).unwrap();
        assert_eq!(recovered.writes().len(), 1);
    }
}
