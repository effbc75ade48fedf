//! The file-level header shared by pages and blocks: `magic(4) |
//! version(1) | flags(1) | count(8)`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use concourse_core::{ConcourseError, Result};
use std::io::{Cursor, Read};

/// The magic bytes at the start of every page/block file.
pub const MAGIC: [u8; 4] = *b"CCR1";

/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// What kind of file a header belongs to, encoded in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A Buffer page.
    Page = 0,
    /// A Database Primary block.
    Primary = 1,
    /// A Database Secondary block.
    Secondary = 2,
    /// A Database Search block.
    Search = 3,
}

impl FileKind {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(FileKind::Page),
            1 => Ok(FileKind::Primary),
            2 => Ok(FileKind::Secondary),
            3 => Ok(FileKind::Search),
            other => Err(ConcourseError::CorruptBlock(format!(
                "unknown file kind flag {other}"
            ))),
        }
    }
}

/// The fixed-size header prefixing every page and block file.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    /// What this file contains.
    pub kind: FileKind,
    /// Number of Writes in the file body.
    pub count: u64,
}

/// Size in bytes of the encoded header.
pub const HEADER_LEN: usize = 4 + 1 + 1 + 8;

impl FileHeader {
    /// Builds a header for `count` Writes of kind `kind`.
    pub fn new(kind: FileKind, count: u64) -> Self {
        FileHeader { kind, count }
    }

    /// Encodes the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = FORMAT_VERSION;
        buf[5] = self.kind as u8;
        (&mut buf[6..14])
            .write_u64::<BigEndian>(self.count)
            .unwrap();
        buf
    }

    /// Decodes a header, validating the magic and format version.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ConcourseError::CorruptBlock(
                "file shorter than header".into(),
            ));
        }
        if bytes[0..4] != MAGIC {
            return Err(ConcourseError::CorruptBlock("bad magic bytes".into()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(ConcourseError::CorruptBlock(format!(
                "unsupported format version {}",
                bytes[4]
            )));
        }
        let kind = FileKind::from_byte(bytes[5])?;
        let mut cur = Cursor::new(&bytes[6..14]);
        let count = cur
            .read_u64::<BigEndian>()
            .map_err(|e| ConcourseError::CorruptBlock(e.to_string()))?;
        Ok(FileHeader { kind, count })
    }
}

/// Reads and validates just the header from an open file-like reader,
/// leaving the cursor positioned at the first Write.
pub fn read_header<R: Read>(r: &mut R) -> Result<FileHeader> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)
        .map_err(|e| ConcourseError::CorruptBlock(e.to_string()))?;
    FileHeader::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = FileHeader::new(FileKind::Primary, 42);
        let bytes = h.encode();
        let decoded = FileHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, FileKind::Primary);
        assert_eq!(decoded.count, 42);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FileHeader::new(FileKind::Page, 0).encode();
        bytes[0] = 0;
        assert!(FileHeader::decode(&bytes).is_err());
    }
}
