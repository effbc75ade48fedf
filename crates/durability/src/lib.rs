//! Crash-recoverable durability for multi-key atomic commits.
//!
//! An atomic operation or transaction stages its Writes into an
//! [`IntentLog`](log::IntentLog) before touching a Buffer. [`recovery::scan`]
//! is how an [`Engine`](../concourse_engine/struct.Engine.html) finds and
//! finishes (or discards) whatever intent logs a crash left behind.

#![warn(missing_docs)]

pub mod intent;
pub mod log;
pub mod recovery;

pub use intent::IntentEntry;
pub use log::IntentLog;
pub use recovery::{discard, scan, RecoveredTransaction};
