//! Embedded client facade over the Concourse storage engine.
//!
//! [`Concourse`] is the operation surface the request-routing server would
//! sit on: auto-committed mutations, present-time and historical lookups,
//! compound `find_or_*` helpers, and token-addressed transactions.
//!
//! ```no_run
//! use concourse_api::Concourse;
//! use concourse_core::{Record, Value};
//!
//! # fn main() -> concourse_core::Result<()> {
//! let db = Concourse::open("./data")?;
//! db.add("name", Value::String("alice".into()), Record::new(1))?;
//! assert_eq!(db.select("name", Record::new(1))?, vec![Value::String("alice".into())]);
//!
//! let token = db.start_transaction()?;
//! db.add_in(&token, "age", Value::Int32(30), Record::new(1))?;
//! assert!(db.commit(&token)?);
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod token;

pub use client::Concourse;
pub use token::{AccessToken, TransactionToken};
