//! Fine-grained locking for Concourse: [`Token`]-keyed point locks via
//! [`LockService`] and per-key range locks via [`RangeLockService`]
//!
//!
//! Neither service knows anything about Writes, Buffers or Databases; they
//! are pure concurrency primitives that `concourse-engine` composes to give
//! atomic operations serializable isolation.

#![warn(missing_docs)]

pub mod extent;
pub mod lock_service;
pub mod range_lock_service;
pub mod token;

pub use extent::{Bound, Extent};
pub use lock_service::{LockService, ReadGuard, WriteGuard};
pub use range_lock_service::{RangeGuard, RangeLockService};
pub use token::{Token, TokenCache, KEY_TOKENS};
