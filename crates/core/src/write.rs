//! The immutable unit of mutation: a single `(key, value, record)` write
//! at a specific version, plus its canonical byte encoding.

use crate::error::{ConcourseError, Result};
use crate::key::Key;
use crate::record::Record;
use crate::value::Value;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{Cursor, Read};

/// Whether a Write adds or removes a `(key, value)` pair from a record.
///
/// Two writes on the same `(key, value, record)` with alternating types
/// cancel out in version order -- the live value set is the set of values
/// for which `#Add - #Remove` is odd as of a given version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    /// The value became a member of `(key, record)`.
    Add = 0,
    /// The value stopped being a member of `(key, record)`.
    Remove = 1,
}

impl WriteType {
    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(WriteType::Add),
            1 => Ok(WriteType::Remove),
            other => Err(ConcourseError::MalformedWrite(format!(
                "unknown write type byte {other}"
            ))),
        }
    }

    /// The opposite type; useful when synthesizing the cancelling write for
    /// `remove` / `set`.
    pub fn invert(self) -> Self {
        match self {
            WriteType::Add => WriteType::Remove,
            WriteType::Remove => WriteType::Add,
        }
    }
}

/// An immutable, versioned mutation.
///
/// Writes are never edited in place; the live state of a record is always
/// derived by replaying the Writes that touch it up to some version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Write {
    /// Add or Remove.
    pub kind: WriteType,
    /// The field this write touches.
    pub key: Key,
    /// The value being added or removed.
    pub value: Value,
    /// The record this write touches.
    pub record: Record,
    /// The strictly-ascending version this write was minted at.
    pub version: u64,
}

impl Write {
    /// Builds a Write. `version` is normally filled in by the owning atomic
    /// operation at commit time; a placeholder of `0` is conventional for
    /// writes that are still buffered.
    pub fn new(kind: WriteType, key: Key, value: Value, record: Record, version: u64) -> Self {
        Write {
            kind,
            key,
            value,
            record,
            version,
        }
    }

    /// Encodes this Write using the canonical, length-prefixed byte layout:
    /// `type(1) | version(8 BE) | record(8 BE) | key(4-len BE + utf8) |
    /// value(1 tag + bytes)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.key.as_str().len());
        buf.write_u8(self.kind.to_byte()).unwrap();
        buf.write_u64::<BigEndian>(self.version).unwrap();
        buf.write_u64::<BigEndian>(self.record.id()).unwrap();

        let key_bytes = self.key.as_str().as_bytes();
        buf.write_u32::<BigEndian>(key_bytes.len() as u32).unwrap();
        buf.extend_from_slice(key_bytes);

        buf.write_u8(self.value.type_tag()).unwrap();
        encode_value_body(&self.value, &mut buf);
        buf
    }

    /// Decodes a Write from its canonical encoding. Fails with
    /// [`ConcourseError::MalformedWrite`] if a length-prefixed section
    /// overruns the remaining bytes or the type byte is unrecognized.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let kind = WriteType::from_byte(read_u8(&mut cur)?)?;
        let version = read_u64(&mut cur)?;
        let record = Record::new(read_u64(&mut cur)?);

        let key_len = read_u32(&mut cur)? as usize;
        let key_bytes = read_exact(&mut cur, key_len)?;
        let key_str = String::from_utf8(key_bytes)
            .map_err(|e| ConcourseError::MalformedWrite(format!("invalid utf-8 key: {e}")))?;
        let key = Key::new(key_str)?;

        let value_tag = read_u8(&mut cur)?;
        let value = decode_value_body(value_tag, &mut cur)?;

        Ok(Write::new(kind, key, value, record, version))
    }

    /// The sort key used by the Primary block: `(record, key, version)`.
    pub fn primary_cmp(&self, other: &Self) -> Ordering {
        (self.record, &self.key, self.version).cmp(&(other.record, &other.key, other.version))
    }

    /// The sort key used by the Secondary block and by `compare`:
    /// `(key, value, record, version)`.
    pub fn secondary_cmp(&self, other: &Self) -> Ordering {
        (&self.key, &self.value, self.record, self.version).cmp(&(
            &other.key,
            &other.value,
            other.record,
            other.version,
        ))
    }
}

/// Lexicographic comparison on `(key, value, record, version)`, as used to
/// sort the Secondary block.
pub fn compare(a: &Write, b: &Write) -> Ordering {
    a.secondary_cmp(b)
}

fn encode_value_body(v: &Value, buf: &mut Vec<u8>) {
    match v {
        Value::Bool(b) => buf.write_u8(*b as u8).unwrap(),
        Value::Int32(i) => buf.write_i32::<BigEndian>(*i).unwrap(),
        Value::Int64(i) => buf.write_i64::<BigEndian>(*i).unwrap(),
        Value::Float(f) => buf.write_u32::<BigEndian>(f.to_bits()).unwrap(),
        Value::Double(f) => buf.write_u64::<BigEndian>(f.to_bits()).unwrap(),
        Value::String(s) => write_len_prefixed(buf, s.as_bytes()),
        Value::Timestamp(t) => buf.write_i64::<BigEndian>(*t).unwrap(),
        Value::Tag(s) => write_len_prefixed(buf, s.as_bytes()),
        Value::Link(r) => buf.write_u64::<BigEndian>(r.id()).unwrap(),
    }
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
    buf.extend_from_slice(bytes);
}

fn decode_value_body(tag: u8, cur: &mut Cursor<&[u8]>) -> Result<Value> {
    Ok(match tag {
        0 => Value::Bool(read_u8(cur)? != 0),
        1 => Value::Int32(read_i32(cur)?),
        2 => Value::Int64(read_i64(cur)?),
        3 => Value::Float(f32::from_bits(read_u32(cur)?)),
        4 => Value::Double(f64::from_bits(read_u64(cur)?)),
        5 => Value::String(read_string(cur)?),
        6 => Value::Timestamp(read_i64(cur)?),
        7 => Value::Tag(read_string(cur)?),
        8 => Value::Link(Record::new(read_u64(cur)?)),
        other => {
            return Err(ConcourseError::MalformedWrite(format!(
                "unknown value type tag {other}"
            )))
        }
    })
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u32(cur)? as usize;
    let bytes = read_exact(cur, len)?;
    String::from_utf8(bytes).map_err(|e| ConcourseError::MalformedWrite(format!("invalid utf-8 value: {e}")))
}

fn read_exact(cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cur.get_ref().len() as u64 - cur.position();
    if len as u64 > remaining {
        return Err(ConcourseError::MalformedWrite(format!(
            "length-prefixed section of {len} bytes exceeds remaining {remaining} bytes"
        )));
    }
    let mut out = vec![0u8; len];
    cur.read_exact(&mut out)
        .map_err(|e| ConcourseError::MalformedWrite(e.to_string()))?;
    Ok(out)
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8> {
    cur.read_u8()
        .map_err(|e| ConcourseError::MalformedWrite(e.to_string()))
}
fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32> {
    cur.read_u32::<BigEndian>()
        .map_err(|e| ConcourseError::MalformedWrite(e.to_string()))
}
fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64> {
    cur.read_u64::<BigEndian>()
        .map_err(|e| ConcourseError::MalformedWrite(e.to_string()))
}
fn read_i32(cur: &mut Cursor<&[u8]>) -> Result<i32> {
    cur.read_i32::<BigEndian>()
        .map_err(|e| ConcourseError::MalformedWrite(e.to_string()))
}
fn read_i64(cur: &mut Cursor<&[u8]>) -> Result<i64> {
    cur.read_i64::<BigEndian>()
        .map_err(|e| ConcourseError::MalformedWrite(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Write {
        Write::new(
            WriteType::Add,
            Key::new("name").unwrap(),
            Value::String("alice".into()),
            Record::new(1),
            42,
        )
    }

    #[test]
    fn round_trip_every_value_type() {
        let values = vec![
            Value::Bool(true),
            Value::Int32(-7),
            Value::Int64(i64::MIN),
            Value::Float(1.5),
            Value::Double(-2.25),
            Value::String("hello world".into()),
            Value::Timestamp(1_700_000_000),
            Value::Tag("category".into()),
            Value::Link(Record::new(99)),
        ];
        for value in values {
            let w = Write::new(WriteType::Add, Key::new("k").unwrap(), value, Record::new(5), 1);
            let bytes = w.encode();
            let decoded = Write::decode(&bytes).unwrap();
            assert_eq!(w, decoded);
        }
    }

    #[test]
    fn decode_rejects_truncated_key_length() {
        let w = sample();
        let mut bytes = w.encode();
        bytes.truncate(13); // cut into the key length prefix's declared payload
        assert!(Write::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_unknown_type_byte() {
        let mut bytes = sample().encode();
        bytes[0] = 0xFF;
        assert!(matches!(
            Write::decode(&bytes),
            Err(ConcourseError::MalformedWrite(_))
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<bool>().prop_map(Value::Bool),
                any::<i32>().prop_map(Value::Int32),
                any::<i64>().prop_map(Value::Int64),
                any::<u32>().prop_map(|bits| Value::Float(f32::from_bits(bits))),
                any::<u64>().prop_map(|bits| Value::Double(f64::from_bits(bits))),
                ".{0,64}".prop_map(Value::String),
                any::<i64>().prop_map(Value::Timestamp),
                "[a-z]{0,16}".prop_map(Value::Tag),
                any::<u64>().prop_map(|id| Value::Link(Record::new(id))),
            ]
        }

        proptest! {
            #[test]
            fn encode_decode_round_trips(
                add in any::<bool>(),
                key in "[a-z_.-]{1,24}",
                value in arb_value(),
                record in any::<u64>(),
                version in any::<u64>(),
            ) {
                let kind = if add { WriteType::Add } else { WriteType::Remove };
                let w = Write::new(kind, Key::new(key).unwrap(), value, Record::new(record), version);
                let decoded = Write::decode(&w.encode()).unwrap();
                // NaN payloads survive because float bodies round-trip as raw bits.
                prop_assert_eq!(w.encode(), decoded.encode());
            }
        }
    }

    #[test]
    fn secondary_order_is_key_value_record_version() {
        let a = Write::new(WriteType::Add, Key::new("a").unwrap(), Value::Int32(1), Record::new(1), 1);
        let b = Write::new(WriteType::Add, Key::new("a").unwrap(), Value::Int32(2), Record::new(0), 0);
        assert_eq!(a.secondary_cmp(&b), Ordering::Less);
    }
}
