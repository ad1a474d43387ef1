//! Project backup engine
//!
//! Archives registered project directories (optionally with a SQL dump of
//! their database), records checksummed artifacts, restores them, and runs
//! recurring and expiry sweeps.

// projectbackup/src/lib.rs
pub mod backup;
pub mod config;
pub mod engine;
pub mod errors;
pub mod integrity;
pub mod notify;
pub mod records;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod storage;
pub mod store;
pub mod utils;
pub mod worker;

pub use engine::Engine;
pub use errors::{EngineError, Result};
