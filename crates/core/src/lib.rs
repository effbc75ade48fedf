//! Canonical data model shared by every Concourse crate: [`Value`], [`Key`],
//! [`Record`], [`Write`] and the storage-engine [`ConcourseError`] type.
//!
//! Nothing in this crate touches disk or locking; it exists so that
//! `concourse-storage`, `concourse-concurrency` and `concourse-engine` all
//! agree on what a mutation looks like and how it is ordered and encoded.

#![warn(missing_docs)]

pub mod error;
pub mod key;
pub mod operator;
pub mod record;
pub mod replay;
pub mod value;
pub mod write;

pub use error::{ConcourseError, Result};
pub use key::Key;
pub use operator::{Operator, OperatorArity};
pub use record::{Record, RecordCounter};
pub use value::Value;
pub use write::{compare, Write, WriteType};
