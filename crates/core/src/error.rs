//! Error kinds surfaced by the storage engine.

use thiserror::Error;

/// The result type used throughout the Concourse crates.
pub type Result<T> = std::result::Result<T, ConcourseError>;

/// Errors that can escape the storage engine to a caller.
///
/// Retriable errors ([`ConcourseError::AtomicState`]) are expected to be
/// recovered locally by a retry helper; everything else is terminal for the
/// operation that raised it.
#[derive(Debug, Error)]
pub enum ConcourseError {
    /// A bad key, a self-link, or a reference to a nonexistent environment.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The atomic operation conflicted with another committer and must be
    /// retried from scratch. [`ConcourseError::retry`] is the canonical
    /// instance inner logic returns to force a restart.
    #[error("atomic operation failed: {0}")]
    AtomicState(String),

    /// The transaction that owns this operation was aborted or committed
    /// concurrently by another caller holding the same handle.
    #[error("transaction state error: {0}")]
    TransactionState(String),

    /// `findOrAdd` / `findOrInsert` matched more than one record.
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// A Write could not be decoded from its canonical byte encoding.
    #[error("malformed write: {0}")]
    MalformedWrite(String),

    /// A block or page failed its integrity check at recovery time.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// The Buffer could not accept a Write because of a fatal disk error.
    #[error("buffer full: {0}")]
    BufferFull(String),

    /// A disk I/O operation failed; the engine should enter a read-only
    /// state rather than silently drop the error.
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    /// A read that requires snapshot semantics was issued directly against
    /// the Engine instead of inside an atomic operation.
    #[error("insufficient atomicity: {0}")]
    InsufficientAtomicity(String),
}

impl ConcourseError {
    /// The canonical "please retry" error, returned by inner atomic-operation
    /// logic to force the surrounding retry helper to restart.
    pub fn retry() -> Self {
        ConcourseError::AtomicState("RETRY".into())
    }

    /// True if this is the retry singleton.
    pub fn is_retry(&self) -> bool {
        matches!(self, ConcourseError::AtomicState(msg) if msg == "RETRY")
    }
}
