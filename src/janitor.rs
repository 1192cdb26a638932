//! Directory lock files, careful directory teardown, and exit-time sweeping
//!
//! The janitor owns the cross-process primitives the deployment engine is
//! built on: the `lockfile.$$$` sentinel with its non-blocking exclusive
//! lock, a delete-directory operation that refuses to touch anything while a
//! peer holds any contained file open, and a process-wide registry of paths
//! to sweep when the process exits. Janitor operations never raise; they
//! report success as `bool`/`Option` so cleanup can never break a deploy.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::SystemTime;

use fs2::FileExt;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::fs::LockedFile;

/// Name of the per-directory lock sentinel.
pub const LOCK_FILE_NAME: &str = "lockfile.$$$";

/// Matcher deciding whether a subdirectory basename is swept by cleanup.
pub type SubdirMatcher = fn(&str) -> bool;

/// Full path of the lock sentinel inside `dir`.
pub fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE_NAME)
}

/// True iff the lock sentinel exists in `dir` (whether or not it is held).
pub fn lock_file_exists(dir: &Path) -> bool {
    lock_file_path(dir).exists()
}

/// Last-modified time of the lock sentinel in `dir`, if readable.
pub fn lock_file_write_time(dir: &Path) -> Option<SystemTime> {
    fs::metadata(lock_file_path(dir))
        .and_then(|m| m.modified())
        .ok()
}

/// The held directory lock: an exclusively locked `lockfile.$$$`.
///
/// Dropping the handle releases the lock, closes the file, and best-effort
/// deletes the sentinel.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Try to create-or-open `dir/lockfile.$$$` with a non-blocking
    /// exclusive lock. Any failure (peer holds the lock, permission denied,
    /// I/O error) yields `None`.
    pub fn try_create(dir: &Path) -> Option<LockFile> {
        let path = lock_file_path(dir);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .ok()?;
        if FileExt::try_lock_exclusive(&file).is_err() {
            return None;
        }
        debug!(path = %path.display(), "directory lock taken");
        Some(LockFile { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite byte zero and flush, refreshing the mtime liveness beacon.
    pub fn touch(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&[0u8])?;
        self.file.sync_data()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
        debug!(path = %self.path.display(), "directory lock released");
    }
}

fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n == LOCK_FILE_NAME)
        .unwrap_or(false)
}

fn try_remove_file(path: &Path) -> bool {
    fs::remove_file(path).is_ok()
}

/// Delete `dir` only if none of its files are held open by a peer.
///
/// Takes the directory lock, then probes every non-lock child with a
/// non-blocking exclusive open. A subdirectory, an unreadable listing, or a
/// single refused probe aborts the whole operation with `false` and no
/// deletions. Only when every child was probed successfully are the probes
/// dropped, the children deleted, the lock released, and the directory
/// removed.
pub fn try_delete_directory(dir: &Path) -> bool {
    let lock = match LockFile::try_create(dir) {
        Some(lock) => lock,
        None => return false,
    };

    let mut probes: Vec<LockedFile> = Vec::new();
    let mut children: Vec<PathBuf> = Vec::new();
    let mut all_probed = true;

    match fs::read_dir(dir) {
        Err(_) => all_probed = false,
        Ok(entries) => {
            for entry in entries {
                let path = match entry {
                    Ok(e) => e.path(),
                    Err(_) => {
                        all_probed = false;
                        break;
                    }
                };
                if is_lock_file(&path) {
                    continue;
                }
                if path.is_dir() {
                    all_probed = false;
                    break;
                }
                match LockedFile::open_exclusive(&path) {
                    Ok(probe) => {
                        probes.push(probe);
                        children.push(path);
                    }
                    Err(_) => {
                        all_probed = false;
                        break;
                    }
                }
            }
        }
    }

    drop(probes);

    if !all_probed {
        return false;
    }

    for path in &children {
        if !try_remove_file(path) {
            return false;
        }
    }

    drop(lock);
    fs::remove_dir(dir).is_ok()
}

/// One registered sweep target.
struct CleanupEntry {
    path: PathBuf,
    clean_self: bool,
    subdir_matcher: Option<SubdirMatcher>,
}

impl CleanupEntry {
    fn try_cleanup(&self) -> bool {
        if !self.path.exists() {
            return true;
        }

        let mut success = true;
        if let Some(matches) = self.subdir_matcher {
            if let Ok(entries) = fs::read_dir(&self.path) {
                for entry in entries.flatten() {
                    let child = entry.path();
                    let name = entry.file_name();
                    if child.is_dir() && name.to_str().map(matches).unwrap_or(false) {
                        success &= try_delete_directory(&child);
                    }
                }
            } else {
                success = false;
            }
        }

        if self.clean_self {
            success &= try_delete_directory(&self.path);
        }

        success
    }
}

static CLEANUP_REGISTRY: Lazy<Mutex<Vec<CleanupEntry>>> = Lazy::new(|| Mutex::new(Vec::new()));
static EXIT_HOOK: Once = Once::new();

/// Register `path` for an exit-time `try_delete_directory`.
pub fn add_cleanup_path(path: &Path) {
    add_cleanup_path_with(path, true, None);
}

/// Register `path` for exit-time sweeping.
///
/// With a `subdir_matcher`, every immediate subdirectory whose basename
/// matches is swept; with `clean_self`, the path itself is swept too.
pub fn add_cleanup_path_with(path: &Path, clean_self: bool, subdir_matcher: Option<SubdirMatcher>) {
    if let Ok(mut registry) = CLEANUP_REGISTRY.lock() {
        registry.push(CleanupEntry {
            path: path.to_path_buf(),
            clean_self,
            subdir_matcher,
        });
    }
}

/// Sweep all registered paths now; entries that sweep clean are removed.
/// Returns true iff the registry is empty afterwards.
pub fn cleanup_now() -> bool {
    match CLEANUP_REGISTRY.lock() {
        Ok(mut registry) => {
            registry.retain(|entry| !entry.try_cleanup());
            registry.is_empty()
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
extern "C" fn exit_hook() {
    cleanup_now();
}

/// Install the process-exit sweep hook. Safe to call repeatedly; the hook is
/// installed at most once. On targets without `atexit` support the call is a
/// no-op and [`cleanup_now`] must be invoked explicitly.
pub fn register_cleanup_on_exit() {
    EXIT_HOOK.call_once(|| {
        #[cfg(unix)]
        unsafe {
            libc::atexit(exit_hook);
        }
    });
}
