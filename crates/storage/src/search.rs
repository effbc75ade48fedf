//! Full-text `search(key, query)` over the live String values of a key.
//!
//! Values are tokenized into lower-cased alphanumeric words; a query
//! matches a value when the query's tokens appear in the value as one
//! contiguous run. Only `String` values participate -- `Tag` values are
//! categorical and exact-match only, so they are never full-text indexed.

use concourse_core::{Record, Value};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Whether `value`'s tokens contain `query_tokens` contiguously. An empty
/// query matches nothing.
fn tokens_match(value_tokens: &[String], query_tokens: &[String]) -> bool {
    if query_tokens.is_empty() || value_tokens.len() < query_tokens.len() {
        return false;
    }
    // Position index over the haystack: each distinct token maps to the
    // offsets it occurs at, so only genuine candidate starts are probed.
    let mut positions: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
    for (i, tok) in value_tokens.iter().enumerate() {
        positions.entry(tok.as_str()).or_default().push(i);
    }
    let Some(starts) = positions.get(query_tokens[0].as_str()) else {
        return false;
    };
    starts.iter().any(|&start| {
        start + query_tokens.len() <= value_tokens.len()
            && query_tokens
                .iter()
                .zip(&value_tokens[start..])
                .all(|(q, v)| q == v)
    })
}

/// Applies a search `query` to a `browse`-style map of live values to the
/// records holding them, returning every record with at least one matching
/// String value.
pub fn find_matches(
    browsed: &BTreeMap<Value, BTreeSet<Record>>,
    query: &str,
) -> BTreeSet<Record> {
    let query_tokens = Value::String(query.to_string()).tokenize();
    let mut matched = BTreeSet::new();
    for (value, records) in browsed {
        if !matches!(value, Value::String(_)) {
            continue;
        }
        if tokens_match(&value.tokenize(), &query_tokens) {
            matched.extend(records.iter().copied());
        }
    }
    matched
}
