//! Advisory-locked file handles
//!
//! Every file the engine observes or mutates is held through a `LockedFile`:
//! shared for readers, exclusive for writers, taken non-blocking so a busy
//! peer surfaces immediately instead of stalling the retry protocol. The
//! lock is advisory; cooperation is by convention, not enforcement.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;

/// An open file together with the advisory lock taken on it.
///
/// The lock is released (and the file closed) on drop. Opening never
/// truncates: if the lock cannot be taken the file contents are untouched,
/// though an exclusive open may have created the file.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
}

impl LockedFile {
    /// Open `path` read-only and take a non-blocking shared lock.
    pub fn open_shared(path: &Path) -> io::Result<LockedFile> {
        let file = OpenOptions::new().read(true).open(path)?;
        // Fully qualified: std's inherent `File::try_lock_shared` (1.89+)
        // would otherwise shadow the fs2 trait method.
        FileExt::try_lock_shared(&file)?;
        Ok(LockedFile { file })
    }

    /// Open `path` create-or-open, read-write, and take a non-blocking
    /// exclusive lock.
    pub fn open_exclusive(path: &Path) -> io::Result<LockedFile> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        FileExt::try_lock_exclusive(&file)?;
        Ok(LockedFile { file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
