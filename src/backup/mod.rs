// projectbackup/src/backup/mod.rs
pub mod archive;
pub mod credentials;
pub mod db_dump;
pub mod guard;
mod logic;

pub use logic::{
    BACKUPS_FOLDER, DatabaseDump, RunOutcome, artifact_relative_path, artifact_stem, run_backup,
};
