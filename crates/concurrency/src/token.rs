//! Opaque resource identifiers used as lock map keys.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;

/// A 128-bit hash naming a lockable resource, with a cardinality hint.
///
/// `cardinality == 1` means the token names a single point resource (for
/// example a specific `(key, value, record)` triple); `cardinality > 1`
/// means it names a range or multi-value resource (for example the full
/// value space of a key, used by `browse`). The hint lets the lock service
/// order acquisitions and detect point/range conflicts without re-deriving
/// them from the original objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    hash: u128,
    cardinality: u32,
}

impl Token {
    /// Hashes a tuple of byte-representable objects into a Token.
    ///
    /// Uses a fixed-seed, two-lane FNV-1a mix so that the same objects
    /// always hash to the same token bytes, across processes and restarts
    /// -- unlike `std::collections::hash_map::DefaultHasher`, which is
    /// randomly seeded per process.
    pub fn of(parts: &[&[u8]], cardinality: u32) -> Self {
        const SEED_LO: u64 = 0xcbf29ce484222325; // FNV offset basis
        const SEED_HI: u64 = 0x100000001b3 ^ 0x9e3779b97f4a7c15;
        let mut lo = SEED_LO;
        let mut hi = SEED_HI;
        for part in parts {
            for &b in *part {
                lo ^= b as u64;
                lo = lo.wrapping_mul(0x100000001b3);
                hi ^= b as u64;
                hi = hi.wrapping_mul(0x9e3779b97f4a7c15);
            }
            // Mix a separator between parts so `["a","bc"]` and `["ab","c"]`
            // never collide.
            lo ^= 0xff;
            lo = lo.wrapping_mul(0x100000001b3);
        }
        Token {
            hash: ((hi as u128) << 64) | lo as u128,
            cardinality,
        }
    }

    /// A point token for a single `(key, value, record)` resource.
    pub fn point(key: &str, value_bytes: &[u8], record: u64) -> Self {
        Token::of(&[key.as_bytes(), value_bytes, &record.to_be_bytes()], 1)
    }

    /// A multi-resource token for the full value range of a key (used by
    /// `browse` and full-key write locks).
    pub fn range(key: &str) -> Self {
        Token::of(&[key.as_bytes()], u32::MAX)
    }

    /// True if this token names a single point resource.
    pub fn is_point(&self) -> bool {
        self.cardinality == 1
    }

    /// The raw 16 bytes of the hash, in a canonical order usable to sort
    /// tokens for deadlock-avoiding lock acquisition.
    pub fn bytes(&self) -> [u8; 16] {
        self.hash.to_be_bytes()
    }
}

/// A fixed-capacity cache mapping strings (typically keys) to their
/// precomputed [`Token`]. A miss hashes and inserts; once full, the cache
/// resets rather than implementing a full LRU, trading a little locality
/// for a lock-free common case.
pub struct TokenCache {
    capacity: usize,
    entries: Mutex<HashMap<String, Token>>,
}

impl TokenCache {
    /// Builds a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        TokenCache {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached token for `key`, computing and caching it as a
    /// range token on a miss.
    pub fn get_or_insert(&self, key: &str) -> Token {
        let mut entries = self.entries.lock();
        if let Some(tok) = entries.get(key) {
            return *tok;
        }
        if entries.len() >= self.capacity {
            entries.clear();
        }
        let tok = Token::range(key);
        entries.insert(key.to_string(), tok);
        tok
    }
}

/// Process-wide cache of 5,000 key tokens, as described in the design notes.
pub static KEY_TOKENS: Lazy<TokenCache> = Lazy::new(|| TokenCache::new(5_000));
