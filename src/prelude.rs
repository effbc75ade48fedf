//! Convenience re-exports for typical embedded use.
//!
//! ```no_run
//! use concourse::prelude::*;
//! ```

pub use crate::{Concourse, ConcourseError, Engine, Key, Operator, Record, Result, TransactionToken, Value};
