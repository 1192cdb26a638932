//! The deployment engine
//!
//! One `load` walks an ordered list of candidate roots and runs the per-root
//! protocol: make sure the directory exists, try the verify fast-path, take
//! the directory lock, verify again (a peer may have just finished), deploy
//! whatever is still missing, then release everything in a fixed order. The
//! lock file's mtime is refreshed between every chunk of I/O so peers can
//! tell a live deployer from an orphaned lock.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tracing::{debug, error, warn};

use crate::bundle::{Bundle, Origin};
use crate::error::{DeployError, DeployResult};
use crate::fs::LockedFile;
use crate::janitor::{self, LockFile};
use crate::loader;
use crate::platform;
use crate::resource::{Resource, MAX_RESOURCE_LENGTH};
use crate::template;

/// Upper bound on a single read/write chunk.
const WRITE_BLOCK_SIZE: usize = 1 << 24;

/// Fixed liveness-beacon period; frequent enough that no concurrent process
/// times out regardless of how big its own files are.
const BEACON_PERIOD: Duration = Duration::from_secs(2);

/// Literal embedded in relocatable libraries where the name suffix goes.
const LIBRARY_NAME_PLACEHOLDER: &str = "@@@@";

#[derive(Debug, Clone, Default)]
pub(crate) struct EngineOptions {
    pub always_overwrite: bool,
    pub reuse_partially_deployed: bool,
    pub should_load_libraries: bool,
    pub random_fallback_subdirectory: bool,
    pub library_suffix: Option<String>,
    pub retry_timeout: Option<Duration>,
}

/// Ordered candidate roots plus the bases registered for exit-time sweeping
/// of random fallback subdirectories.
pub(crate) struct CandidatePlan {
    pub roots: Vec<PathBuf>,
    pub cleanup: Vec<PathBuf>,
}

/// Build the candidate-root list for an expanded deployment path.
///
/// Absolute paths stand alone (plus an optional random fallback child);
/// relative paths are joined onto each platform data root, then the system
/// temp directory, then a random child of that.
pub(crate) fn plan_candidates(destination: &str, random_fallback: bool) -> CandidatePlan {
    let path = PathBuf::from(destination);
    let mut roots = Vec::new();
    let mut cleanup = Vec::new();

    if path.is_absolute() {
        roots.push(path.clone());
        if random_fallback {
            roots.push(path.join(template::random_token()));
            cleanup.push(path);
        }
    } else {
        for root in platform::data_roots() {
            roots.push(root.join(&path));
        }
        let temp_base = env::temp_dir().join(&path);
        roots.push(temp_base.clone());
        roots.push(temp_base.join(template::random_token()));
        cleanup.push(temp_base);
    }

    CandidatePlan { roots, cleanup }
}

pub(crate) struct Engine {
    bundle: Bundle,
    options: EngineOptions,
    resources: Vec<Resource>,
    max_resource_length: usize,
    retry_timeout: Duration,
    lock: Option<LockFile>,
    beacon_last: Instant,
    input_buffer: Vec<u8>,
    output_buffer: Vec<u8>,
}

impl Engine {
    pub(crate) fn new(bundle: Bundle, resources: Vec<Resource>, options: EngineOptions) -> Engine {
        let max_resource_length = resources.iter().map(|r| r.length as usize).max().unwrap_or(0);
        let total_length: u64 = resources.iter().map(|r| u64::from(r.length)).sum();
        // Sized for roughly 4 MB/s plus four seconds of headroom.
        let retry_timeout = options
            .retry_timeout
            .unwrap_or_else(|| Duration::from_millis(total_length / 4000 + 4000));

        Engine {
            bundle,
            options,
            resources,
            max_resource_length,
            retry_timeout,
            lock: None,
            beacon_last: Instant::now(),
            input_buffer: Vec::new(),
            output_buffer: Vec::new(),
        }
    }

    /// Try every candidate root in order; the first success wins. Only when
    /// all candidates fail is the retained (last) error raised.
    pub(crate) fn load(&mut self, destination: &str) -> DeployResult<PathBuf> {
        let plan = plan_candidates(destination, self.options.random_fallback_subdirectory);
        for base in &plan.cleanup {
            janitor::add_cleanup_path_with(base, false, Some(template::is_random_token));
        }
        janitor::register_cleanup_on_exit();

        debug!(
            timeout_ms = self.retry_timeout.as_millis() as u64,
            roots = ?plan.roots,
            "starting deployment"
        );

        let mut last_error: Option<DeployError> = None;
        let mut last_used: Option<PathBuf> = None;
        for root in plan.roots {
            last_used = Some(root.clone());
            match self.try_load_at(&root) {
                Ok(()) => return Ok(root),
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "deployment attempt failed");
                    last_error = Some(e);
                }
            }
        }

        if let Some(path) = last_used {
            error!(path = %path.display(), "every deployment root failed");
        }
        Err(last_error
            .unwrap_or_else(|| DeployError::config("no usable deployment root candidates")))
    }

    /// Run the whole per-root protocol against one candidate, releasing the
    /// directory lock and all non-pinned read locks on every exit path.
    fn try_load_at(&mut self, root: &Path) -> DeployResult<()> {
        ensure_directory(root)?;

        let result = self.verify_or_deploy(root).and_then(|_| {
            if !self.options.should_load_libraries {
                return Ok(());
            }
            loader::load_all(&mut self.resources, root)?;
            if !platform::is_windows() {
                loader::pin_loaded(&mut self.resources);
            }
            Ok(())
        });

        if result.is_err() && self.options.should_load_libraries {
            // Libraries stay mapped (the platform does not truly unload),
            // but the flags must not claim success for a failed root.
            for resource in &mut self.resources {
                resource.is_loaded = false;
            }
        }

        self.release_read_locks();
        self.release_directory_lock();
        result
    }

    fn verify_or_deploy(&mut self, root: &Path) -> DeployResult<()> {
        self.release_read_locks();

        if self.verify_existing(root)? {
            debug!("all files already deployed");
            return Ok(());
        }

        self.acquire_directory_lock(root)?;

        // A peer may have finished deploying while we waited for the lock.
        if self.verify_existing(root)? {
            debug!("verified files after taking the lock");
            return Ok(());
        }

        debug!(path = %root.display(), "deploying resources");
        self.beacon_reset();
        self.deploy_files(root)?;
        self.touch_beacon(false)
            .map_err(|e| DeployError::io(root, e))
    }

    /// Count output files that exist (`found`) and can be shared-locked
    /// (`opened`), retrying on a mixed result until the timeout runs out.
    fn verify_existing(&mut self, root: &Path) -> DeployResult<bool> {
        if self.options.always_overwrite {
            return Ok(false);
        }
        if !self.options.reuse_partially_deployed {
            self.release_read_locks();
        }

        let expected = self.resources.len();
        let mut remaining = self.retry_timeout;
        let verified = loop {
            let mut found = 0;
            let mut opened = 0;
            for resource in &mut self.resources {
                let file_path = root.join(&resource.output_name);
                if !file_path.exists() {
                    continue;
                }
                found += 1;
                if resource.read_lock.is_none() {
                    match LockedFile::open_shared(&file_path) {
                        Ok(lock) => resource.read_lock = Some(lock),
                        Err(_) => continue,
                    }
                }
                opened += 1;
            }

            if found == 0 {
                break false;
            }
            if opened == expected {
                break true;
            }
            if opened == found {
                // No contention, files are simply missing.
                break false;
            }
            if janitor::lock_file_exists(root) {
                // A peer is mid-deploy; the caller queues on its lock.
                break false;
            }

            // Unlockable files without a lock file: something is writing
            // outside the protocol. Wait it out until the timeout expires.
            let slept = random_sleep(remaining);
            remaining = remaining.saturating_sub(slept);
            if remaining.is_zero() {
                break false;
            }
        };

        if !verified && !self.options.reuse_partially_deployed {
            self.release_read_locks();
        }
        Ok(verified)
    }

    /// Take the directory lock, retrying while the holder's beacon is live
    /// and surfacing `DeployLocked` once the lock looks orphaned.
    fn acquire_directory_lock(&mut self, root: &Path) -> DeployResult<()> {
        let timeout = self.retry_timeout;
        let overall_start = Instant::now();
        let mut window_start = overall_start;
        let mut retries: i32 = 3;

        loop {
            if let Some(lock) = LockFile::try_create(root) {
                self.lock = Some(lock);
                return Ok(());
            }

            let elapsed = window_start.elapsed();
            // Sleep at least once regardless of how much time remains.
            random_sleep(timeout.saturating_sub(elapsed));
            if elapsed < timeout {
                continue;
            }
            retries -= 1;
            if retries >= 0 {
                continue;
            }

            let timeout_ms = timeout.as_millis() as u64;
            let age_ms = lock_file_age_ms(root);
            // Live window reaches retry_timeout into the past and ten times
            // that into the future, tolerating peer clock skew.
            if age_ms < timeout_ms as i64 && age_ms > -10 * timeout_ms as i64 {
                debug!(age_ms, "peer beacon is live, lock timer extended");
                window_start = Instant::now();
                retries = 3;
                continue;
            }

            return Err(DeployError::DeployLocked {
                path: root.to_path_buf(),
                timeout_ms,
                elapsed_ms: overall_start.elapsed().as_millis() as u64,
                age_ms,
            });
        }
    }

    /// Write every resource that does not already hold a read lock.
    fn deploy_files(&mut self, root: &Path) -> DeployResult<()> {
        // Already-locked (reused) files first so the skip is cheap, then
        // descending size so a full disk surfaces before small files waste
        // work.
        self.resources.sort_by(|a, b| {
            b.read_lock
                .is_some()
                .cmp(&a.read_lock.is_some())
                .then_with(|| b.length.cmp(&a.length))
        });

        if self.input_buffer.len() < self.max_resource_length {
            self.input_buffer.resize(self.max_resource_length, 0);
        }

        for i in 0..self.resources.len() {
            if self.resources[i].read_lock.is_some() {
                continue;
            }

            let origin = self.resources[i].origin.clone();
            let length = self.resources[i].length as usize;
            let is_compressed = self.resources[i].is_compressed;
            let is_library = self.resources[i].is_dynamic_library;
            let file_path = root.join(&self.resources[i].output_name);

            debug!(path = %file_path.display(), length, "reading source");
            self.read_source(&origin, length, &file_path)?;

            if is_compressed {
                self.decompress(length, &file_path)?;
            }

            self.touch_beacon(false)
                .map_err(|e| DeployError::io(&file_path, e))?;

            if is_library {
                if let Some(suffix) = self.options.library_suffix.clone() {
                    let data = if is_compressed {
                        &mut self.output_buffer[..]
                    } else {
                        &mut self.input_buffer[..length]
                    };
                    patch_embedded_reference(data, &suffix);
                }
            }

            debug!(path = %file_path.display(), "writing");
            self.write_destination(&file_path, is_compressed, length)?;

            let lock = LockedFile::open_shared(&file_path)
                .map_err(|e| DeployError::io(&file_path, e))?;
            self.resources[i].read_lock = Some(lock);
        }

        Ok(())
    }

    fn read_source(&mut self, origin: &Origin, length: usize, file_path: &Path) -> DeployResult<()> {
        let mut reader = self.bundle.open(origin)?;
        let mut pos = 0;
        while pos < length {
            let end = (pos + WRITE_BLOCK_SIZE).min(length);
            reader
                .read_exact(&mut self.input_buffer[pos..end])
                .map_err(|e| DeployError::io(file_path, e))?;
            pos = end;
            self.touch_beacon(false)
                .map_err(|e| DeployError::io(file_path, e))?;
        }
        Ok(())
    }

    /// One-shot decompression into the monotonically growing output buffer.
    fn decompress(&mut self, length: usize, file_path: &Path) -> DeployResult<()> {
        let src = &self.input_buffer[..length];
        let frame_size = zstd::zstd_safe::get_frame_content_size(src).map_err(|e| {
            DeployError::io(
                file_path,
                io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
            )
        })?;
        let out_len = match frame_size {
            Some(n) if n <= MAX_RESOURCE_LENGTH => n as usize,
            Some(n) => {
                return Err(DeployError::ResourceInvalid {
                    name: file_name(file_path),
                    message: format!("decompressed size {n} is too big"),
                })
            }
            None => {
                return Err(DeployError::io(
                    file_path,
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        "decompressed size missing from frame header",
                    ),
                ))
            }
        };

        self.output_buffer.clear();
        self.output_buffer.reserve(out_len);
        let mut decompressor =
            zstd::bulk::Decompressor::new().map_err(|e| DeployError::io(file_path, e))?;
        let written = decompressor
            .decompress_to_buffer(src, &mut self.output_buffer)
            .map_err(|e| DeployError::io(file_path, e))?;
        debug_assert_eq!(written, out_len);
        Ok(())
    }

    /// Create the destination under an exclusive lock, size it, and stream
    /// the data out in bounded chunks with sync + beacon between them.
    fn write_destination(
        &mut self,
        file_path: &Path,
        from_output_buffer: bool,
        input_len: usize,
    ) -> DeployResult<()> {
        let data_len = if from_output_buffer {
            self.output_buffer.len()
        } else {
            input_len
        };

        let out = LockedFile::open_exclusive(file_path)
            .map_err(|e| DeployError::io(file_path, e))?;
        out.file()
            .set_len(data_len as u64)
            .map_err(|e| DeployError::io(file_path, e))?;

        let mut writer = out.file();
        let mut pos = 0;
        while pos < data_len {
            let end = (pos + WRITE_BLOCK_SIZE).min(data_len);
            let chunk = if from_output_buffer {
                &self.output_buffer[pos..end]
            } else {
                &self.input_buffer[pos..end]
            };
            writer
                .write_all(chunk)
                .map_err(|e| DeployError::io(file_path, e))?;
            pos = end;
            if pos < data_len {
                out.file()
                    .sync_data()
                    .map_err(|e| DeployError::io(file_path, e))?;
            }
            self.touch_beacon(false)
                .map_err(|e| DeployError::io(file_path, e))?;
        }

        drop(out);
        Ok(())
    }

    fn release_read_locks(&mut self) {
        for resource in &mut self.resources {
            resource.read_lock = None;
        }
    }

    /// Final beacon touch, then release (and delete) the lock file.
    fn release_directory_lock(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            let _ = lock.touch();
        }
    }

    fn beacon_reset(&mut self) {
        self.beacon_last = Instant::now()
            .checked_sub(BEACON_PERIOD)
            .unwrap_or_else(Instant::now);
    }

    fn touch_beacon(&mut self, force: bool) -> io::Result<()> {
        if let Some(lock) = self.lock.as_mut() {
            if force || self.beacon_last.elapsed() >= BEACON_PERIOD {
                self.beacon_last = Instant::now();
                lock.touch()?;
                debug!("lock file beacon updated");
            }
        }
        Ok(())
    }
}

fn ensure_directory(path: &Path) -> DeployResult<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(DeployError::io(
                path,
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "deployment path exists and is not a directory",
                ),
            ));
        }
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| DeployError::io(path, e))
}

/// Sleep a uniform 16-47 ms, clamped to `limit` but always at least 1 ms.
/// Returns the time actually slept.
pub(crate) fn random_sleep(limit: Duration) -> Duration {
    let millis: u64 = rand::thread_rng().gen_range(16..48);
    let limit_ms = (limit.as_millis() as u64).max(1);
    let sleep = Duration::from_millis(millis.min(limit_ms));
    thread::sleep(sleep);
    sleep
}

/// Signed age of the lock file: positive when its mtime is in the past.
/// An unreadable lock file counts as infinitely old.
fn lock_file_age_ms(root: &Path) -> i64 {
    let Some(mtime) = janitor::lock_file_write_time(root) else {
        return i64::MAX;
    };
    let now = SystemTime::now();
    match now.duration_since(mtime) {
        Ok(age) => age.as_millis().min(i64::MAX as u128) as i64,
        Err(ahead) => -(ahead.duration().as_millis().min(i64::MAX as u128) as i64),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Overwrite the first embedded `@@@@<libext>` reference with
/// `<suffix><libext>`, zero-padded to the original length.
///
/// The padding only matches runtime behavior when the embedded reference is
/// null-terminated in the binary; behavior for non-null-terminated
/// references is undefined.
fn patch_embedded_reference(data: &mut [u8], suffix: &str) {
    if platform::is_windows() {
        return;
    }
    if suffix.is_empty() || suffix.len() > LIBRARY_NAME_PLACEHOLDER.len() {
        return;
    }

    let from = format!("{LIBRARY_NAME_PLACEHOLDER}{}", platform::library_extension());
    let to = format!("{suffix}{}", platform::library_extension());
    let from_bytes = from.as_bytes();
    let to_bytes = to.as_bytes();
    if data.len() < from_bytes.len() {
        return;
    }

    for i in 0..=data.len() - from_bytes.len() {
        if &data[i..i + from_bytes.len()] == from_bytes {
            for (k, slot) in data[i..i + from_bytes.len()].iter_mut().enumerate() {
                *slot = if k < to_bytes.len() { to_bytes[k] } else { 0 };
            }
            return;
        }
    }
}
