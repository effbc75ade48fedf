//! The three sorted, indexed block types a Database epoch is made of:
//! Primary (sorted by record), Secondary (sorted by
//! key then value), and Search (a tokenized inverted index over string
//! values).
//!
//! Each block is a `.blk` file of length-framed Writes in sort order plus a
//! `.idx` sidecar: a sparse list of `(sort key, byte offset)` entries taken
//! every [`INDEX_STRIDE`] records. The sidecar exists for format parity with
//! a future memory-mapped cold path; the block itself is small enough
//! once ingested that every query here resolves against the fully
//! materialized, already-sorted `Vec<Write>` rather than seeking through the
//! idx file.

use crate::format::{FileHeader, FileKind, HEADER_LEN};
use crate::page::{frame, scan_frames};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use concourse_core::{ConcourseError, Record, Result, Write as CWrite};
use std::fs::File;
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};

/// How many records separate consecutive sparse index entries.
pub const INDEX_STRIDE: usize = 64;

/// Which of the three sort orders a block uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Sorted by `(record, key, version)`.
    Primary,
    /// Sorted by `(key, value, record, version)`.
    Secondary,
    /// A tokenized inverted index over string-valued Writes.
    Search,
}

impl BlockKind {
    fn file_kind(self) -> FileKind {
        match self {
            BlockKind::Primary => FileKind::Primary,
            BlockKind::Secondary => FileKind::Secondary,
            BlockKind::Search => FileKind::Search,
        }
    }
}

/// One sparse index entry: the byte offset (from the start of the body,
/// i.e. after the header) of the record at `record_index`.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    record_index: u64,
    offset: u64,
}

fn write_index(path: &Path, kind: FileKind, body_crc: u32, entries: &[IndexEntry]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&FileHeader::new(kind, entries.len() as u64).encode())?;
    file.write_u32::<BigEndian>(body_crc)?;
    for e in entries {
        file.write_u64::<BigEndian>(e.record_index)?;
        file.write_u64::<BigEndian>(e.offset)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Reads the body checksum recorded in a block's `.idx` sidecar.
fn read_index_crc(path: &Path, kind: FileKind) -> Result<u32> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let header = FileHeader::decode(&bytes)?;
    if header.kind != kind {
        return Err(ConcourseError::CorruptBlock(format!(
            "{} has kind {:?}, expected {:?}",
            path.display(),
            header.kind,
            kind
        )));
    }
    let mut cur = std::io::Cursor::new(&bytes[HEADER_LEN..]);
    cur.read_u32::<BigEndian>()
        .map_err(|e| ConcourseError::CorruptBlock(e.to_string()))
}

/// A single sorted, queryable block: an in-memory resident copy of its
/// Writes plus the on-disk `.blk`/`.idx` pair that back it.
pub struct Block {
    kind: BlockKind,
    blk_path: PathBuf,
    writes: Vec<CWrite>,
}

impl Block {
    /// Sorts `writes` per `kind`'s order, writes the `.blk` and `.idx`
    /// files at `dir/<epoch>.blk` / `.idx`, and returns the resident block.
    pub fn build(dir: &Path, epoch: u64, kind: BlockKind, mut writes: Vec<CWrite>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        match kind {
            BlockKind::Primary => writes.sort_by(|a, b| a.primary_cmp(b)),
            BlockKind::Secondary | BlockKind::Search => writes.sort_by(|a, b| a.secondary_cmp(b)),
        }

        let blk_path = dir.join(format!("{epoch}.blk"));
        let idx_path = dir.join(format!("{epoch}.idx"));
        let blk_tmp = dir.join(format!("{epoch}.blk.tmp"));
        let idx_tmp = dir.join(format!("{epoch}.idx.tmp"));

        let mut file = File::create(&blk_tmp)?;
        file.write_all(&FileHeader::new(kind.file_kind(), writes.len() as u64).encode())?;

        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut crc = crc32fast::Hasher::new();
        for (i, w) in writes.iter().enumerate() {
            if i % INDEX_STRIDE == 0 {
                entries.push(IndexEntry { record_index: i as u64, offset });
            }
            let framed = frame(w);
            file.write_all(&framed)?;
            crc.update(&framed);
            offset += framed.len() as u64;
        }
        file.sync_all()?;
        write_index(&idx_tmp, kind.file_kind(), crc.finalize(), &entries)?;

        // Sealed names only ever refer to complete files; a crash mid-build
        // leaves only .tmp debris for recovery to sweep.
        std::fs::rename(&blk_tmp, &blk_path)?;
        std::fs::rename(&idx_tmp, &idx_path)?;

        Ok(Block { kind, blk_path, writes })
    }

    /// Loads a previously built block from `dir/<epoch>.blk`, validating
    /// that it is not truncated and that its body matches the checksum in
    /// the `.idx` sidecar (sealed blocks must never change).
    pub fn load(dir: &Path, epoch: u64, kind: BlockKind) -> Result<Self> {
        let blk_path = dir.join(format!("{epoch}.blk"));
        let idx_path = dir.join(format!("{epoch}.idx"));
        let mut bytes = Vec::new();
        File::open(&blk_path)?.read_to_end(&mut bytes)?;
        let header = FileHeader::decode(&bytes)?;
        if header.kind != kind.file_kind() {
            return Err(ConcourseError::CorruptBlock(format!(
                "{} has kind {:?}, expected {:?}",
                blk_path.display(),
                header.kind,
                kind.file_kind()
            )));
        }
        let (writes, good_len) = scan_frames(&bytes[HEADER_LEN..]);
        if HEADER_LEN + good_len != bytes.len() {
            return Err(ConcourseError::CorruptBlock(format!(
                "{} has a truncated trailing write",
                blk_path.display()
            )));
        }
        if writes.len() as u64 != header.count {
            return Err(ConcourseError::CorruptBlock(format!(
                "{} header promised {} writes but {} were read",
                blk_path.display(),
                header.count,
                writes.len()
            )));
        }
        let expected_crc = read_index_crc(&idx_path, kind.file_kind())?;
        let actual_crc = crc32fast::hash(&bytes[HEADER_LEN..]);
        if actual_crc != expected_crc {
            return Err(ConcourseError::CorruptBlock(format!(
                "{} body checksum {actual_crc:08x} does not match indexed {expected_crc:08x}",
                blk_path.display()
            )));
        }
        Ok(Block { kind, blk_path, writes })
    }

    /// Which sort order this block uses.
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// The resident, sorted Writes.
    pub fn writes(&self) -> &[CWrite] {
        &self.writes
    }

    /// The `.blk` file path.
    pub fn path(&self) -> &Path {
        &self.blk_path
    }

    /// Binary-searches the Primary block for the first/last index bounding
    /// `record`, using the same order the block was built with. Returns an
    /// empty slice if `record` has no entries.
    pub fn primary_range(&self, record: Record) -> &[CWrite] {
        debug_assert_eq!(self.kind, BlockKind::Primary);
        let start = self.writes.partition_point(|w| w.record < record);
        let end = self.writes.partition_point(|w| w.record <= record);
        &self.writes[start..end]
    }
}
