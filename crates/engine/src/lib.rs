//! The Concourse storage engine's orchestration layer: the
//! [`BufferedStore`] that fuses one environment's Buffer and Database, the
//! [`AtomicOperation`]/[`Transaction`] protocol that gives writers
//! serializable isolation, and the [`Engine`] that owns environments, the
//! version clock, and the background transfer and group-commit threads.
//!
//! ```no_run
//! use concourse_engine::Engine;
//! use concourse_core::{Key, Record, Value};
//!
//! # fn main() -> concourse_core::Result<()> {
//! let engine = Engine::open("./data")?;
//! let env = engine.default_environment()?;
//! env.add(Key::new("name")?, Value::String("alice".into()), Record::new(1))?;
//! assert!(env.verify(&Key::new("name")?, &Value::String("alice".into()), Record::new(1), None));
//! engine.stop()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod atomic;
pub mod buffered_store;
pub mod engine;
pub mod transaction;

pub use atomic::{execute_with_retry, supply_with_retry, AtomicOperation, AtomicState};
pub use buffered_store::{BufferedStore, DEFAULT_TRANSFER_BUDGET_BYTES};
pub use engine::{
    Engine, EngineBuilder, Environment, VersionClock, DEFAULT_ENVIRONMENT, GROUP_COMMIT_INTERVAL,
    TRANSFER_INTERVAL,
};
pub use transaction::Transaction;
