//! File-backed state cache.
//!
//! Each row lives in `<dir>/<row_id>.snapshot.json`. The file is JSON and can
//! be inspected directly:
//!
//! ```text
//! $ cat cache/state.snapshot.json | jq .
//! {
//!   "state": { "users": { ... } },
//!   "seq": 1284,
//!   "rev": "7-a3f2e1b09c4d5e6f"
//! }
//! ```

use crate::cache::{CacheRow, RevisionToken, StateCache, check_revision};
use crate::error::CacheError;
use crate::state::State;
use async_trait::async_trait;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A [`StateCache`] that keeps one snapshot file per row.
///
/// Compare-and-swap is made atomic across processes with an exclusive lock
/// on `<row_id>.lock`.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    dir: PathBuf,
}

impl SnapshotCache {
    /// Open a cache directory, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for a row.
    pub fn row_path(&self, row_id: &str) -> PathBuf {
        self.dir.join(format!("{row_id}.snapshot.json"))
    }

    fn lock_path(&self, row_id: &str) -> PathBuf {
        self.dir.join(format!("{row_id}.lock"))
    }
}

/// Save a row atomically to disk.
///
/// Writes to a `.tmp` file first, syncs, then renames to the final path.
/// If the process crashes mid-write, the old snapshot file survives intact.
pub fn save<S: Serialize>(path: &Path, row: &CacheRow<S>) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    let json = serde_json::to_string_pretty(row)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_data()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a row from disk.
///
/// Returns `Ok(None)` if the file doesn't exist or if deserialization fails
/// (a corrupt snapshot is treated as missing, so the next write recreates it
/// and the projection replays from sequence 0).
pub fn load<S: DeserializeOwned>(path: &Path) -> io::Result<Option<CacheRow<S>>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_str(&contents) {
        Ok(row) => Ok(Some(row)),
        Err(_) => Ok(None),
    }
}

fn put_locked<S: State>(
    row_path: &Path,
    lock_path: &Path,
    row_id: &str,
    row: CacheRow<S>,
) -> Result<RevisionToken, CacheError> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;
    lock.lock_exclusive()?;

    let result: Result<RevisionToken, CacheError> = (|| {
        let current = load::<S>(row_path)?.and_then(|r| r.rev);
        check_revision(row_id, current.as_ref(), row.rev.as_ref())?;

        let body = serde_json::to_vec(&row)?;
        let token = RevisionToken::next(current.as_ref(), &body);
        save(row_path, &CacheRow::new(row.state, row.seq, Some(token.clone())))?;
        Ok(token)
    })();

    let unlocked = FileExt::unlock(&lock);
    let token = result?;
    unlocked?;
    Ok(token)
}

#[async_trait]
impl<S: State> StateCache<S> for SnapshotCache {
    async fn get(&self, row_id: &str) -> Result<CacheRow<S>, CacheError> {
        let path = self.row_path(row_id);
        let row = tokio::task::spawn_blocking(move || load::<S>(&path))
            .await
            .map_err(|e| CacheError::Io(io::Error::other(e)))??;
        row.ok_or_else(|| CacheError::NotFound(row_id.to_string()))
    }

    async fn put(&self, row_id: &str, row: CacheRow<S>) -> Result<RevisionToken, CacheError> {
        let row_path = self.row_path(row_id);
        let lock_path = self.lock_path(row_id);
        let row_id = row_id.to_string();
        tokio::task::spawn_blocking(move || put_locked(&row_path, &lock_path, &row_id, row))
            .await
            .map_err(|e| CacheError::Io(io::Error::other(e)))?
    }
}
