//! Pure functions that replay a stream of [`Write`]s into the live state
//! they represent.
//!
//! This is the one place the live-set rule -- a value set at `(key,
//! record, t)` is determined solely by the Writes with `version <= t` --
//! is coded: everything downstream -- the Buffer, the Database, and the
//! BufferedStore's merge of the two -- calls through here instead of
//! re-deriving the semantics.

use crate::operator::Operator;
use crate::record::Record;
use crate::value::Value;
use crate::write::{Write, WriteType};
use std::collections::{BTreeMap, BTreeSet};

/// Net ADD/REMOVE parity for one `(key, value)` pair on a record, plus the
/// order its value was first observed in (so `select` can preserve ADD
/// order among the values that end up live).
struct Parity {
    order: usize,
    net: i64,
}

fn accumulate(writes: &[&Write], key: &str, record: Record, at: Option<u64>) -> Vec<(Value, Parity)> {
    let mut entries: Vec<(Value, Parity)> = Vec::new();
    let index_of = |entries: &[(Value, Parity)], v: &Value| entries.iter().position(|(x, _)| x == v);

    let mut writes: Vec<&Write> = writes
        .iter()
        .copied()
        .filter(|w| w.key.as_str() == key && w.record == record)
        .filter(|w| at.map_or(true, |t| w.version <= t))
        .collect();
    writes.sort_by_key(|w| w.version);

    for w in writes {
        let delta = match w.kind {
            WriteType::Add => 1,
            WriteType::Remove => -1,
        };
        match index_of(&entries, &w.value) {
            Some(i) => entries[i].1.net += delta,
            None => entries.push((
                w.value.clone(),
                Parity {
                    order: entries.len(),
                    net: delta,
                },
            )),
        }
    }
    entries
}

fn is_live(p: &Parity) -> bool {
    p.net.rem_euclid(2) == 1
}

/// Whether `value` is a live member of `(key, record)` as of `at`
/// (`None` means "now", i.e. consider every write).
pub fn verify(writes: &[&Write], key: &str, value: &Value, record: Record, at: Option<u64>) -> bool {
    accumulate(writes, key, record, at)
        .iter()
        .any(|(v, p)| v == value && is_live(p))
}

/// The live value set for `(key, record)` as of `at`, in the order each
/// value was first added.
pub fn select(writes: &[&Write], key: &str, record: Record, at: Option<u64>) -> Vec<Value> {
    let mut entries = accumulate(writes, key, record, at);
    entries.sort_by_key(|(_, p)| p.order);
    entries
        .into_iter()
        .filter(|(_, p)| is_live(p))
        .map(|(v, _)| v)
        .collect()
}

/// `select(record)`: every key on `record` mapped to its live value set as
/// of `at`, omitting keys whose live set is empty.
pub fn select_record(writes: &[&Write], record: Record, at: Option<u64>) -> BTreeMap<String, Vec<Value>> {
    let keys: BTreeSet<&str> = writes
        .iter()
        .filter(|w| w.record == record)
        .map(|w| w.key.as_str())
        .collect();

    let mut out = BTreeMap::new();
    for key in keys {
        let live = select(writes, key, record, at);
        if !live.is_empty() {
            out.insert(key.to_string(), live);
        }
    }
    out
}

/// `describe(record)`: the keys on `record` with at least one live value as
/// of `at`.
pub fn describe(writes: &[&Write], record: Record, at: Option<u64>) -> BTreeSet<String> {
    select_record(writes, record, at).into_keys().collect()
}

/// `browse(key)`: every live value for `key` across all records, mapped to
/// the set of records it is live on.
pub fn browse(writes: &[&Write], key: &str, at: Option<u64>) -> BTreeMap<Value, BTreeSet<Record>> {
    let records: BTreeSet<Record> = writes
        .iter()
        .filter(|w| w.key.as_str() == key)
        .map(|w| w.record)
        .collect();

    let mut out: BTreeMap<Value, BTreeSet<Record>> = BTreeMap::new();
    for record in records {
        for value in select(writes, key, record, at) {
            out.entry(value).or_default().insert(record);
        }
    }
    out
}

/// Every key under which some record holds a live link to `target`, mapped
/// to those records. This is the reverse edge set `consolidate`-style
/// operations need.
pub fn incoming_links(writes: &[&Write], target: Record, at: Option<u64>) -> BTreeMap<String, BTreeSet<Record>> {
    let candidates: BTreeSet<(&str, Record)> = writes
        .iter()
        .filter(|w| matches!(w.value, Value::Link(r) if r == target))
        .map(|w| (w.key.as_str(), w.record))
        .collect();

    let mut out: BTreeMap<String, BTreeSet<Record>> = BTreeMap::new();
    for (key, record) in candidates {
        if verify(writes, key, &Value::Link(target), record, at) {
            out.entry(key.to_string()).or_default().insert(record);
        }
    }
    out
}

/// All records for which `find` should return true, given an operator and
/// its operand values.
pub fn find(writes: &[&Write], key: &str, op: Operator, values: &[Value], at: Option<u64>) -> BTreeSet<Record> {
    let records: BTreeSet<Record> = writes
        .iter()
        .filter(|w| w.key.as_str() == key)
        .map(|w| w.record)
        .collect();

    let mut matched = BTreeSet::new();
    for record in records {
        let live = select(writes, key, record, at);
        if live.iter().any(|v| matches_operator(v, op, values)) {
            matched.insert(record);
        }
    }
    matched
}

fn matches_operator(v: &Value, op: Operator, values: &[Value]) -> bool {
    match (op, values) {
        (Operator::Equals, [a]) => v == a,
        (Operator::NotEquals, [a]) => v != a,
        (Operator::GreaterThan, [a]) => v > a,
        (Operator::GreaterThanOrEquals, [a]) => v >= a,
        (Operator::LessThan, [a]) => v < a,
        (Operator::LessThanOrEquals, [a]) => v <= a,
        (Operator::Between, [lo, hi]) => v >= lo && v < hi,
        (Operator::LinksTo, [a]) => matches!((v, a), (Value::Link(r), Value::Link(target)) if r == target),
        // REGEX / NOT_REGEX need a compiled pattern; evaluated by the caller
        // (concourse-storage depends on `regex`, concourse-core does not).
        (Operator::Regex | Operator::NotRegex, _) => false,
        _ => false,
    }
}

/// One entry in a `chronologize` result: the version a write took effect at,
/// and the resulting live value set.
pub type ChronologizeEntry = (u64, Vec<Value>);

/// `chronologize(key, record, start, end)`: the live value set after every
/// Write to `(key, record)` with `start <= version < end`.
pub fn chronologize(writes: &[&Write], key: &str, record: Record, start: u64, end: u64) -> Vec<ChronologizeEntry> {
    let mut versions: Vec<u64> = writes
        .iter()
        .filter(|w| w.key.as_str() == key && w.record == record)
        .map(|w| w.version)
        .filter(|v| *v >= start && *v < end)
        .collect();
    versions.sort_unstable();
    versions.dedup();
    versions
        .into_iter()
        .map(|v| (v, select(writes, key, record, Some(v))))
        .collect()
}

/// `review(record, [key])`: a human-readable description of every Write
/// touching the record (optionally restricted to one key), in version order.
pub fn review(writes: &[&Write], record: Record, key: Option<&str>) -> Vec<(u64, String)> {
    let mut filtered: Vec<&Write> = writes
        .iter()
        .copied()
        .filter(|w| w.record == record)
        .filter(|w| key.map_or(true, |k| w.key.as_str() == k))
        .collect();
    filtered.sort_by_key(|w| w.version);
    filtered
        .into_iter()
        .map(|w| {
            let verb = match w.kind {
                WriteType::Add => "ADDED",
                WriteType::Remove => "REMOVED",
            };
            (
                w.version,
                format!("{verb} {} AS {} IN {}", w.value, w.key, w.record),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn w(kind: WriteType, key: &str, value: Value, record: u64, version: u64) -> Write {
        Write::new(kind, Key::new(key).unwrap(), value, Record::new(record), version)
    }

    #[test]
    fn add_remove_parity_determines_liveness() {
        let writes = vec![
            w(WriteType::Add, "k", Value::Int32(1), 1, 1),
            w(WriteType::Remove, "k", Value::Int32(1), 1, 2),
            w(WriteType::Add, "k", Value::Int32(1), 1, 3),
        ];
        let refs: Vec<&Write> = writes.iter().collect();
        assert!(verify(&refs, "k", &Value::Int32(1), Record::new(1), None));
        assert!(!verify(&refs, "k", &Value::Int32(1), Record::new(1), Some(2)));
        assert!(verify(&refs, "k", &Value::Int32(1), Record::new(1), Some(1)));
    }

    #[test]
    fn select_preserves_add_order() {
        let writes = vec![
            w(WriteType::Add, "k", Value::Int32(2), 1, 1),
            w(WriteType::Add, "k", Value::Int32(1), 1, 2),
        ];
        let refs: Vec<&Write> = writes.iter().collect();
        assert_eq!(select(&refs, "k", Record::new(1), None), vec![Value::Int32(2), Value::Int32(1)]);
    }

    #[test]
    fn select_record_omits_keys_with_empty_live_sets() {
        let writes = vec![
            w(WriteType::Add, "name", Value::String("alice".into()), 1, 1),
            w(WriteType::Add, "age", Value::Int32(30), 1, 2),
            w(WriteType::Remove, "age", Value::Int32(30), 1, 3),
        ];
        let refs: Vec<&Write> = writes.iter().collect();
        let by_key = select_record(&refs, Record::new(1), None);
        assert_eq!(by_key.len(), 1);
        assert!(by_key.contains_key("name"));
        assert_eq!(describe(&refs, Record::new(1), None), std::collections::BTreeSet::from(["name".to_string()]));
    }

    #[test]
    fn chronologize_tracks_the_live_set_through_history() {
        let writes = vec![
            w(WriteType::Add, "k", Value::Int32(1), 1, 1),
            w(WriteType::Add, "k", Value::Int32(2), 1, 2),
            w(WriteType::Remove, "k", Value::Int32(1), 1, 3),
            w(WriteType::Add, "k", Value::Int32(3), 1, 4),
        ];
        let refs: Vec<&Write> = writes.iter().collect();
        let timeline = chronologize(&refs, "k", Record::new(1), 0, u64::MAX);
        assert_eq!(timeline.len(), 4);
        assert_eq!(timeline[3].1, vec![Value::Int32(2), Value::Int32(3)]);
    }
}
