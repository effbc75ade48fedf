//! Field-name keys and their validation rules.

use crate::error::{ConcourseError, Result};
use serde::{Deserialize, Serialize};

/// The characters a key may never contain.
///
/// Whitespace and control codes are excluded because keys are echoed
/// unquoted into CCL query text by the (out of scope) parser; the
/// remaining characters are reserved CCL syntax tokens.
const RESERVED: &[char] = &[',', '(', ')', '[', ']', '"', '\''];

/// A non-empty, printable field name.
///
/// `Key` wraps a `String` behind a validating constructor so that once
/// constructed, a key is known to satisfy the naming rules everywhere else
/// in the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    /// Validates and wraps a key string.
    ///
    /// Rejects the empty string, any whitespace or ASCII control character,
    /// and the reserved CCL punctuation tokens.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() {
            return Err(ConcourseError::InvalidArgument(
                "key must not be empty".into(),
            ));
        }
        for c in s.chars() {
            if c.is_whitespace() || c.is_control() {
                return Err(ConcourseError::InvalidArgument(format!(
                    "key {s:?} contains whitespace or control characters"
                )));
            }
            if RESERVED.contains(&c) {
                return Err(ConcourseError::InvalidArgument(format!(
                    "key {s:?} contains reserved character {c:?}"
                )));
            }
        }
        Ok(Key(s))
    }

    /// Borrows the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key, returning the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}
