//! Dynamic-library loading and process-wide handle pinning
//!
//! Libraries are loaded in ascending `order`, sweeping repeatedly until a
//! full pass makes no progress; that resolves inter-library dependencies
//! without anyone declaring them. Loaded handles are parked for the life of
//! the process (the platform never truly unloads), and on non-Windows the
//! deployed files' shared read locks are pinned alongside so peers cannot
//! delete or rewrite a mapped library.

use std::path::Path;
use std::sync::Mutex;

use libloading::Library;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{DeployError, DeployResult};
use crate::fs::LockedFile;
use crate::resource::Resource;

/// Loaded library handles, parked so they are never dropped (dropping would
/// ask the platform to unload).
static PARKED_LIBRARIES: Lazy<Mutex<Vec<Library>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Read locks pinned for the life of the process.
static PINNED_LOCKS: Lazy<Mutex<Vec<LockedFile>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Load every dynamic-library resource from `root`, iterating to a fixed
/// point; fails with the last loader error if any library stays unloaded.
pub(crate) fn load_all(resources: &mut [Resource], root: &Path) -> DeployResult<()> {
    resources.sort_by_key(|r| (r.order, r.index));

    let mut last_error: Option<DeployError> = None;
    loop {
        let mut progressed = false;
        for resource in resources
            .iter_mut()
            .filter(|r| r.is_dynamic_library && !r.is_loaded)
        {
            let path = root.join(&resource.output_name);
            debug!(path = %path.display(), order = resource.order, "loading dynamic library");
            match unsafe { Library::new(&path) } {
                Ok(library) => {
                    if let Ok(mut parked) = PARKED_LIBRARIES.lock() {
                        parked.push(library);
                    } else {
                        std::mem::forget(library);
                    }
                    resource.is_loaded = true;
                    progressed = true;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "library load deferred");
                    last_error = Some(DeployError::LibraryLoad {
                        path,
                        message: e.to_string(),
                    });
                }
            }
        }
        if !progressed {
            break;
        }
    }

    if resources.iter().any(|r| r.is_dynamic_library && !r.is_loaded) {
        return Err(last_error.unwrap_or_else(|| DeployError::LibraryLoad {
            path: root.to_path_buf(),
            message: "library left unloaded".to_string(),
        }));
    }
    Ok(())
}

/// Move the read locks of loaded libraries into the process-wide pinned
/// list, so they outlive the engine and keep the files protected.
pub(crate) fn pin_loaded(resources: &mut [Resource]) {
    for resource in resources
        .iter_mut()
        .filter(|r| r.is_dynamic_library && r.is_loaded)
    {
        if let Some(lock) = resource.read_lock.take() {
            if let Ok(mut pinned) = PINNED_LOCKS.lock() {
                pinned.push(lock);
            }
        }
    }
}

/// Number of read locks currently pinned process-wide.
pub fn pinned_lock_count() -> usize {
    PINNED_LOCKS.lock().map(|p| p.len()).unwrap_or(0)
}
