//! Regex/not-regex matching against a key's live value set for `find`.
//! Kept out of `concourse-core` because regex evaluation pulls in
//! the `regex` crate, which the core data model has no other use for.

use concourse_core::{Operator, Record, Value};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Applies [`Operator::Regex`] or [`Operator::NotRegex`] to a `browse`-style
/// map of live values to the records holding them, returning every matching
/// record. `pattern` must be the single operand in `values`.
pub fn find_regex(
    browsed: &BTreeMap<Value, BTreeSet<Record>>,
    op: Operator,
    pattern: &str,
) -> concourse_core::Result<BTreeSet<Record>> {
    let re = regex::Regex::new(pattern)
        .map_err(|e| concourse_core::ConcourseError::InvalidArgument(format!("invalid regex {pattern:?}: {e}")))?;
    let negate = matches!(op, Operator::NotRegex);

    let mut matched = BTreeSet::new();
    for (value, records) in browsed {
        let text = match value {
            Value::String(s) | Value::Tag(s) => s.as_str(),
            _ => continue,
        };
        if re.is_match(text) != negate {
            matched.extend(records.iter().copied());
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_matches_substring() {
        let mut browsed = BTreeMap::new();
        browsed.insert(Value::String("alice@example.com".into()), BTreeSet::from([Record::new(1)]));
        browsed.insert(Value::String("bob@example.org".into()), BTreeSet::from([Record::new(2)]));
        let matched = find_regex(&browsed, Operator::Regex, r"\.com$").unwrap();
        assert_eq!(matched, BTreeSet::from([Record::new(1)]));
    }

    #[test]
    fn not_regex_negates() {
        let mut browsed = BTreeMap::new();
        browsed.insert(Value::String("alice@example.com".into()), BTreeSet::from([Record::new(1)]));
        browsed.insert(Value::String("bob@example.org".into()), BTreeSet::from([Record::new(2)]));
        let matched = find_regex(&browsed, Operator::NotRegex, r"\.com$").unwrap();
        assert_eq!(matched, BTreeSet::from([Record::new(2)]));
    }
}
