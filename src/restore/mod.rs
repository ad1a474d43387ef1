// projectbackup/src/restore/mod.rs
pub mod db_restore;
mod logic;

pub use logic::{DatabaseRestore, RestoreOutcome, restore};
