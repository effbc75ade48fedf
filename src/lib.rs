//! # Concourse
//!
//! A schemaless, version-controlled, transactional document-graph storage
//! engine.
//!
//! Clients assert facts of the form `(key, value, record)`. Every
//! assertion is versioned and immutable: reads can be answered at any
//! historical timestamp, and ACID transactions with serializable isolation
//! span any set of records.
//!
//! ## Quick Start
//!
//! ```no_run
//! use concourse::prelude::*;
//!
//! # fn main() -> concourse::Result<()> {
//! // Open a database
//! let db = Concourse::open("./my-db")?;
//!
//! // Assert and query facts
//! db.add("name", Value::String("alice".into()), Record::new(1))?;
//! let names = db.select("name", Record::new(1))?;
//!
//! // Historical reads
//! let then = db.time();
//! db.set("name", Value::String("bob".into()), Record::new(1))?;
//! let before = db.select_at("name", Record::new(1), then)?;
//!
//! // Transactions
//! let token = db.start_transaction()?;
//! db.add_in(&token, "age", Value::Int32(30), Record::new(1))?;
//! db.commit(&token)?;
//!
//! // Graceful shutdown
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layering
//!
//! - [`concourse_core`] -- the data model: [`Value`], [`Key`], [`Record`],
//!   [`Write`], and the pure replay semantics every store shares.
//! - [`concourse_storage`] -- the Buffer (durable write log) and Database
//!   (indexed block archive).
//! - [`concourse_concurrency`] -- token and range locking.
//! - [`concourse_durability`] -- the transaction intent log.
//! - [`concourse_engine`] -- atomic operations, transactions, and the
//!   [`Engine`] orchestrator.
//! - [`concourse_api`] -- the embedded [`Concourse`] client facade.

#![warn(missing_docs)]

pub mod prelude;

// Re-export main entry points
pub use concourse_api::{AccessToken, Concourse, TransactionToken};
pub use concourse_engine::{Engine, EngineBuilder, Environment};

// Re-export the data model
pub use concourse_core::{
    ConcourseError, Key, Operator, Record, Result, Value, Write, WriteType,
};
