//! Canonical value type for Concourse.
//!
//! A [`Value`] is the only thing that can sit on the right-hand side of a
//! `(key, value, record)` assertion. It is a small tagged union rather than
//! an open-ended document type: Concourse is schemaless at the record level
//! (any key may hold any value type) but every individual value is one of a
//! fixed set of primitive scalars or a link to another record.
//!
//! Ordering and equality are both derived from the canonical byte encoding
//! (see [`crate::write`]): values of different types never compare equal,
//! and cross-type ordering follows a fixed type precedence rather than any
//! attempt at numeric coercion.

use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A typed, comparable scalar or link.
///
/// Eight scalar variants, matching the tagged union in the data model --
/// `Bool`, `Int32`, `Int64`, `Float`, `Double`, `String`, `Timestamp` and
/// `Tag` -- plus `Link` for record-to-record references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A 32-bit signed integer.
    Int32(i32),
    /// A 64-bit signed integer.
    Int64(i64),
    /// A 32-bit IEEE-754 float.
    Float(f32),
    /// A 64-bit IEEE-754 float.
    Double(f64),
    /// A UTF-8 string.
    String(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    /// An interned-looking string compared separately from `String`, for
    /// categorical, exact-match-only values.
    Tag(String),
    /// A reference to another record.
    Link(Record),
}

/// Type precedence for cross-type ordering:
/// `bool < int32 < int64 < float < double < string < tag < link < timestamp`.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Bool(_) => 0,
        Value::Int32(_) => 1,
        Value::Int64(_) => 2,
        Value::Float(_) => 3,
        Value::Double(_) => 4,
        Value::String(_) => 5,
        Value::Tag(_) => 6,
        Value::Link(_) => 7,
        Value::Timestamp(_) => 8,
    }
}

impl Value {
    /// The 1-byte type tag used in the canonical write encoding.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int32(_) => 1,
            Value::Int64(_) => 2,
            Value::Float(_) => 3,
            Value::Double(_) => 4,
            Value::String(_) => 5,
            Value::Timestamp(_) => 6,
            Value::Tag(_) => 7,
            Value::Link(_) => 8,
        }
    }

    /// Human readable name of the variant, for error messages and `describe`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOLEAN",
            Value::Int32(_) => "INTEGER",
            Value::Int64(_) => "LONG",
            Value::Float(_) => "FLOAT",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "STRING",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Tag(_) => "TAG",
            Value::Link(_) => "LINK",
        }
    }

    /// Returns the linked record, if this is a `Link` value.
    pub fn as_link(&self) -> Option<Record> {
        match self {
            Value::Link(r) => Some(*r),
            _ => None,
        }
    }

    /// Tokenizes a `String` value into lower-cased words for the search
    /// index. Non-string values have no tokens.
    pub fn tokenize(&self) -> Vec<String> {
        match self {
            Value::String(s) => s
                .split_whitespace()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Equality follows the same total order as `Ord`, so float variants
/// compare by bit pattern (`total_cmp`): NaN equals itself, and ordered
/// containers keyed by `Value` stay consistent.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = type_rank(self).cmp(&type_rank(other));
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Tag(a), Value::Tag(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => unreachable!("type_rank already separated variants"),
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        type_rank(self).hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int32(i) => i.hash(state),
            Value::Int64(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Double(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Tag(s) => s.hash(state),
            Value::Link(r) => r.hash(state),
            Value::Timestamp(t) => t.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(i) => write!(f, "{i}"),
            Value::Int64(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Double(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::Tag(s) => write!(f, "{s}"),
            Value::Link(r) => write!(f, "@{r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_types_never_equal() {
        assert_ne!(Value::Int32(1), Value::Int64(1));
        assert_ne!(Value::String("1".into()), Value::Tag("1".into()));
    }

    #[test]
    fn cross_type_precedence() {
        assert!(Value::Bool(true) < Value::Int32(0));
        assert!(Value::Int32(i32::MAX) < Value::Int64(i64::MIN));
        assert!(Value::Double(0.0) < Value::String(String::new()));
        assert!(Value::Tag("z".into()) < Value::Link(Record::new(0)));
        assert!(Value::Link(Record::new(u64::MAX)) < Value::Timestamp(i64::MIN));
    }

    #[test]
    fn natural_order_within_type() {
        assert!(Value::Int64(1) < Value::Int64(2));
        assert!(Value::String("a".into()) < Value::String("b".into()));
    }

    #[test]
    fn tokenize_string_value() {
        let v = Value::String("The Quick, Brown Fox!".into());
        assert_eq!(v.tokenize(), vec!["the", "quick", "brown", "fox"]);
    }
}
