//! Atomic snapshot persistence for per-repo queue state.
//!
//! Each repository's queue state is stored as a single JSON document at
//! `<state_dir>/<owner>/<repo>/queue.json`, rewritten after every committed
//! transaction.
//!
//! # Atomic Writes
//!
//! Snapshots are written atomically using a write-to-temp-then-rename pattern:
//! 1. Write to `queue.json.tmp`
//! 2. fsync the file
//! 3. Rename to `queue.json`
//! 4. fsync the directory
//!
//! This ensures that readers always see either the old or new snapshot,
//! never a partial write. Without the directory fsync, a rename may not
//! survive a power loss even if the file contents were synced.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use thiserror::Error;

use super::RepoState;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch.
    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Syncs a file's contents and metadata to disk.
fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory to disk, ensuring directory entries are durable.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Saves a repo snapshot atomically to disk.
pub fn save_snapshot_atomic(path: &Path, state: &RepoState) -> Result<(), SnapshotError> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(state)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads a repo snapshot from disk. Returns `None` if the file does not exist.
pub fn load_snapshot(path: &Path) -> Result<Option<RepoState>, SnapshotError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let state: RepoState = serde_json::from_slice(&bytes)?;
    if state.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: state.schema_version,
        });
    }

    Ok(Some(state))
}
