use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use gapwatch_core::GapwatchError;

/// A file rewritten whole, through a temp-file rename, from snapshots taken
/// under the caller's own lock.
///
/// Callers `stamp` a snapshot while holding the lock that guards the data,
/// release it, and then `write`. A snapshot older than the one already on
/// disk is discarded, so writes finishing out of order never roll the file
/// back.
pub(crate) struct SnapshotFile {
    path: PathBuf,
    stamped: AtomicU64,
    written: Mutex<u64>,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            stamped: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number for a snapshot taken now. Call under the data lock.
    pub fn stamp(&self) -> u64 {
        self.stamped.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Write `body` unless a newer snapshot is already on disk. Returns
    /// whether the file was written.
    pub fn write(&self, seq: u64, body: &[u8]) -> Result<bool, GapwatchError> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if seq <= *written {
            return Ok(false);
        }
        write_atomic(&self.path, body)?;
        *written = seq;
        Ok(true)
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), GapwatchError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| GapwatchError::persistence(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(|e| GapwatchError::persistence(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| GapwatchError::persistence(path, e))
}
