//! Cross-Process File Lock
//!
//! Serializes read-modify-write sequences on a shared file between cooperating
//! processes. A lock on `<resource>` is an exclusively created marker file
//! `<resource>.lock` holding the owner's pid, acquisition time and a token
//! unique to that acquisition. The holder keeps the marker open with an
//! exclusive OS lock on it for as long as it holds the lock.
//!
//! A process that dies while holding a lock leaves its marker behind, but the
//! OS drops its file lock. With stale detection enabled, a waiter takes over a
//! marker that is older than the configured threshold and that it can lock
//! itself. A live holder is never displaced, however old its marker.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{ArchError, Result};
use crate::storage;

/// Suffix appended to a resource path to form its lock marker path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Default time to wait for a contended lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default polling interval while waiting.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Default age after which a marker is considered abandoned.
pub const DEFAULT_STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(30);

/// Options controlling [`FileLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up after waiting this long.
    pub timeout: Duration,

    /// Poll interval while the lock is held elsewhere.
    pub retry_interval: Duration,

    /// Markers older than this are candidates for takeover.
    pub stale_lock_threshold: Duration,

    /// Whether abandoned markers are taken over while waiting.
    pub detect_stale_locks: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stale_lock_threshold: DEFAULT_STALE_LOCK_THRESHOLD,
            detect_stale_locks: true,
        }
    }
}

impl LockOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_stale_lock_threshold(mut self, threshold: Duration) -> Self {
        self.stale_lock_threshold = threshold;
        self
    }

    pub fn with_stale_detection(mut self, enabled: bool) -> Self {
        self.detect_stale_locks = enabled;
        self
    }
}

/// Contents of a lock marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    /// Process ID that created the lock.
    pub pid: u32,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Identifies one acquisition; release only removes a marker carrying it.
    #[serde(default)]
    pub token: String,
}

/// The open, OS-locked marker of an acquired lock.
#[derive(Debug)]
struct HeldMarker {
    file: File,
    token: String,
}

/// A lock on a single resource path.
///
/// Dropping an acquired lock releases it; failures during that implicit
/// release are logged. Call [`FileLock::release`] to observe them.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
    held: Option<HeldMarker>,
}

impl FileLock {
    /// Create an (unacquired) lock for `resource`.
    pub fn new(resource: impl AsRef<Path>) -> Self {
        Self {
            lock_path: Self::lock_path_for(resource.as_ref()),
            held: None,
        }
    }

    /// The marker path used for `resource`: `<resource>.lock`.
    pub fn lock_path_for(resource: &Path) -> PathBuf {
        let mut path: OsString = resource.as_os_str().to_os_string();
        path.push(LOCK_SUFFIX);
        PathBuf::from(path)
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_acquired(&self) -> bool {
        self.held.is_some()
    }

    /// Acquire the lock, polling until `options.timeout` elapses.
    ///
    /// Acquiring an already acquired instance is a no-op.
    ///
    /// # Errors
    /// `ArchError::LockTimeout` when the lock is still held after the timeout,
    /// `ArchError::LockAcquireFailed` on unexpected filesystem errors.
    pub fn acquire(&mut self, options: &LockOptions) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            if let Some(held) = self.try_create_marker()? {
                self.held = Some(held);
                debug!("Acquired lock {}", self.lock_path.display());
                return Ok(());
            }

            if options.detect_stale_locks
                && marker_is_stale(&self.lock_path, options.stale_lock_threshold)
            {
                if let Some(held) = self.try_take_over()? {
                    warn!(
                        "Took over abandoned lock {} (older than {} ms)",
                        self.lock_path.display(),
                        options.stale_lock_threshold.as_millis()
                    );
                    self.held = Some(held);
                    return Ok(());
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= options.timeout {
                return Err(ArchError::LockTimeout {
                    path: self.lock_path.clone(),
                    timeout_ms: options.timeout.as_millis(),
                });
            }

            thread::sleep(options.retry_interval.min(options.timeout - elapsed));
        }
    }

    /// Release the lock. A no-op if this instance never acquired it.
    ///
    /// # Errors
    /// `ArchError::LockReleaseFailed` if the marker cannot be removed, or if
    /// it is missing or now carries another holder's token. A marker that
    /// belongs to someone else is left in place.
    pub fn release(&mut self) -> Result<()> {
        let held = match self.held.take() {
            Some(held) => held,
            None => return Ok(()),
        };

        if !marker_owned_by(&self.lock_path, &held.token) {
            return Err(ArchError::LockReleaseFailed {
                path: self.lock_path.clone(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    "lock marker is missing or owned by another holder",
                ),
            });
        }

        // Remove while still holding the OS lock; dropping `held` unlocks.
        fs::remove_file(&self.lock_path).map_err(|e| ArchError::LockReleaseFailed {
            path: self.lock_path.clone(),
            source: e,
        })?;
        drop(held);
        debug!("Released lock {}", self.lock_path.display());
        Ok(())
    }

    /// Run `f` while holding the lock.
    ///
    /// The lock is released on every exit path. If `f` fails its error is
    /// returned after the release; otherwise a release failure is returned.
    pub fn with_lock<T, F>(&mut self, options: &LockOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.acquire(options)?;
        let outcome = f();
        let released = self.release();

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!("{} (while handling: {})", release_err, err);
                Err(err)
            }
        }
    }

    /// Whether a lock marker currently exists for `resource`.
    pub fn exists(resource: &Path) -> bool {
        Self::lock_path_for(resource).exists()
    }

    /// Whether `resource` has a marker older than `threshold` that no live
    /// process holds.
    pub fn is_lock_stale(resource: &Path, threshold: Duration) -> bool {
        let lock_path = Self::lock_path_for(resource);
        marker_is_stale(&lock_path, threshold) && !marker_is_held(&lock_path)
    }

    /// Remove the marker for `resource` if it is stale. Returns whether one was removed.
    pub fn cleanup_stale_locks(resource: &Path, threshold: Duration) -> Result<bool> {
        let lock_path = Self::lock_path_for(resource);
        if !marker_is_stale(&lock_path, threshold) {
            return Ok(false);
        }

        let file = match open_marker(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(ArchError::LockAcquireFailed {
                    path: lock_path,
                    source: e,
                })
            }
        };
        if file.try_lock_exclusive().is_err() || !same_marker(&file, &lock_path) {
            return Ok(false);
        }

        let removed = storage::remove_if_exists(&lock_path)?;
        drop(file);
        Ok(removed)
    }

    /// Unconditionally remove the marker for `resource`.
    ///
    /// Intended for operator cleanup: a `FileLock` instance that believed it
    /// held the lock is not told, and its next `release` will fail.
    pub fn force_remove(resource: &Path) -> Result<bool> {
        storage::remove_if_exists(&Self::lock_path_for(resource))
    }

    /// Read the marker for `resource`, if present and well formed.
    pub fn holder(resource: &Path) -> Option<LockHolder> {
        read_holder(&Self::lock_path_for(resource))
    }

    /// Every lock marker below `root`, returned as the resources they guard.
    pub fn find_locked_resources(root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?;
                let resource = name.strip_suffix(LOCK_SUFFIX)?;
                Some(entry.path().with_file_name(resource))
            })
            .collect()
    }

    fn acquire_failed(&self, source: io::Error) -> ArchError {
        ArchError::LockAcquireFailed {
            path: self.lock_path.clone(),
            source,
        }
    }

    /// Create a fresh marker. `None` if one already exists.
    fn try_create_marker(&self) -> Result<Option<HeldMarker>> {
        if let Some(parent) = self.lock_path.parent() {
            storage::ensure_dir(parent)?;
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(self.acquire_failed(e)),
        };

        self.claim_created(file, new_token(), write_holder).map(Some)
    }

    /// Lock a marker this instance just created and record the holder.
    ///
    /// On failure the marker is removed, so a half-written marker never
    /// blocks other processes.
    fn claim_created<W>(&self, mut file: File, token: String, write: W) -> Result<HeldMarker>
    where
        W: FnOnce(&mut File, &str) -> io::Result<()>,
    {
        let written = file
            .try_lock_exclusive()
            .and_then(|()| write(&mut file, &token));
        if let Err(e) = written {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&self.lock_path) {
                warn!(
                    "Failed to remove half-written lock {}: {}",
                    self.lock_path.display(),
                    remove_err
                );
            }
            return Err(self.acquire_failed(e));
        }

        Ok(HeldMarker { file, token })
    }

    /// Take over an existing marker whose holder no longer holds its OS lock.
    fn try_take_over(&self) -> Result<Option<HeldMarker>> {
        let mut file = match open_marker(&self.lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.acquire_failed(e)),
        };

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        // The marker may have been released and replaced since we opened it.
        if !same_marker(&file, &self.lock_path) {
            return Ok(None);
        }

        let token = new_token();
        write_holder(&mut file, &token).map_err(|e| self.acquire_failed(e))?;
        Ok(Some(HeldMarker { file, token }))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let held = match self.held.take() {
            Some(held) => held,
            None => return,
        };
        if !marker_owned_by(&self.lock_path, &held.token) {
            warn!(
                "Lock {} was taken over or removed; leaving it in place",
                self.lock_path.display()
            );
            return;
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to release lock {} on drop: {}",
                self.lock_path.display(),
                e
            ),
        }
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

fn open_marker(lock_path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(lock_path)
}

fn write_holder(file: &mut File, token: &str) -> io::Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at: Utc::now(),
        token: token.to_string(),
    };
    let content = serde_json::to_vec(&holder)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&content)?;
    file.flush()
}

fn read_holder(lock_path: &Path) -> Option<LockHolder> {
    let content = fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&content).ok()
}

fn marker_owned_by(lock_path: &Path, token: &str) -> bool {
    read_holder(lock_path).map_or(false, |holder| holder.token == token)
}

/// Whether some open handle holds the OS lock on the marker.
fn marker_is_held(lock_path: &Path) -> bool {
    match open_marker(lock_path) {
        Ok(file) => file.try_lock_exclusive().is_err(),
        Err(_) => false,
    }
}

/// Whether `file` is still the marker at `lock_path`.
#[cfg(unix)]
fn same_marker(file: &File, lock_path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(lock_path)) {
        (Ok(open), Ok(current)) => open.dev() == current.dev() && open.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_marker(_file: &File, lock_path: &Path) -> bool {
    lock_path.exists()
}

/// Marker age from its modification time; unreadable markers are not stale.
fn marker_is_stale(lock_path: &Path, threshold: Duration) -> bool {
    let modified = match fs::metadata(lock_path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > threshold)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_options() -> LockOptions {
        LockOptions::default()
            .with_timeout(Duration::from_millis(150))
            .with_retry_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_lock_path_appends_suffix() {
        let path = FileLock::lock_path_for(Path::new("/tmp/model/manifest.json"));
        assert_eq!(path, PathBuf::from("/tmp/model/manifest.json.lock"));
    }

    #[test]
    fn test_acquire_writes_holder() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("manifest.json");
        let mut lock = FileLock::new(&resource);

        lock.acquire(&fast_options()).unwrap();

        assert!(lock.is_acquired());
        assert!(FileLock::exists(&resource));
        let holder = FileLock::holder(&resource).unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert!(!holder.token.is_empty());

        lock.release().unwrap();
        assert!(!FileLock::exists(&resource));
    }

    #[test]
    fn test_each_acquisition_gets_new_token() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let mut lock = FileLock::new(&resource);

        lock.acquire(&fast_options()).unwrap();
        let first = FileLock::holder(&resource).unwrap().token;
        lock.release().unwrap();
        lock.acquire(&fast_options()).unwrap();
        let second = FileLock::holder(&resource).unwrap().token;

        assert_ne!(first, second);
    }

    #[test]
    fn test_failed_holder_write_removes_marker() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let lock = FileLock::new(&resource);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(lock.lock_path())
            .unwrap();

        let result = lock.claim_created(file, new_token(), |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        });

        assert!(matches!(result, Err(ArchError::LockAcquireFailed { .. })));
        assert!(!FileLock::exists(&resource));
        FileLock::new(&resource).acquire(&fast_options()).unwrap();
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let temp = TempDir::new().unwrap();
        let mut lock = FileLock::new(temp.path().join("r.json"));
        lock.release().unwrap();
    }

    #[test]
    fn test_release_after_force_remove_fails() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let mut lock = FileLock::new(&resource);
        lock.acquire(&fast_options()).unwrap();

        assert!(FileLock::force_remove(&resource).unwrap());
        assert!(lock.is_acquired());

        let result = lock.release();
        assert!(matches!(result, Err(ArchError::LockReleaseFailed { .. })));
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_timeout_error_mentions_timeout() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let mut first = FileLock::new(&resource);
        first.acquire(&fast_options()).unwrap();

        let mut second = FileLock::new(&resource);
        let err = second.acquire(&fast_options()).unwrap_err();

        assert!(matches!(err, ArchError::LockTimeout { timeout_ms: 150, .. }));
        assert!(err.to_string().contains("150 ms"));
        assert!(!second.is_acquired());
    }

    #[test]
    fn test_live_holder_is_never_taken_over() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let mut first = FileLock::new(&resource);
        first.acquire(&fast_options()).unwrap();
        thread::sleep(Duration::from_millis(40));

        let options = fast_options().with_stale_lock_threshold(Duration::from_millis(10));
        let mut second = FileLock::new(&resource);

        assert!(!FileLock::is_lock_stale(&resource, Duration::from_millis(10)));
        assert!(matches!(
            second.acquire(&options),
            Err(ArchError::LockTimeout { .. })
        ));
        assert!(!FileLock::cleanup_stale_locks(&resource, Duration::from_millis(10)).unwrap());
        first.release().unwrap();
    }

    #[test]
    fn test_abandoned_marker_is_taken_over_in_place() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        fs::write(
            FileLock::lock_path_for(&resource),
            r#"{"pid":1,"acquiredAt":"2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(30));

        let options = fast_options().with_stale_lock_threshold(Duration::from_millis(10));
        let mut lock = FileLock::new(&resource);
        lock.acquire(&options).unwrap();

        let holder = FileLock::holder(&resource).unwrap();
        assert_eq!(holder.pid, std::process::id());
        lock.release().unwrap();
        assert!(!FileLock::exists(&resource));
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let mut lock = FileLock::new(&resource);

        let result: Result<()> = lock.with_lock(&fast_options(), || {
            assert!(FileLock::exists(&resource));
            Err(ArchError::Internal("boom".to_string()))
        });

        assert!(matches!(result, Err(ArchError::Internal(_))));
        assert!(!FileLock::exists(&resource));
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_with_lock_returns_value() {
        let temp = TempDir::new().unwrap();
        let mut lock = FileLock::new(temp.path().join("r.json"));
        let value = lock.with_lock(&fast_options(), || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        {
            let mut lock = FileLock::new(&resource);
            lock.acquire(&fast_options()).unwrap();
        }
        assert!(!FileLock::exists(&resource));
    }

    #[test]
    fn test_drop_leaves_foreign_marker() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        let mut stale = FileLock::new(&resource);
        stale.acquire(&fast_options()).unwrap();
        FileLock::force_remove(&resource).unwrap();

        let mut current = FileLock::new(&resource);
        current.acquire(&fast_options()).unwrap();
        drop(stale);

        assert!(FileLock::exists(&resource));
        current.release().unwrap();
    }

    #[test]
    fn test_stale_helpers() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("r.json");
        fs::write(FileLock::lock_path_for(&resource), "{}").unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(!FileLock::is_lock_stale(&resource, Duration::from_secs(60)));
        assert!(!FileLock::cleanup_stale_locks(&resource, Duration::from_secs(60)).unwrap());
        assert!(FileLock::is_lock_stale(&resource, Duration::from_millis(10)));
        assert!(FileLock::cleanup_stale_locks(&resource, Duration::from_millis(10)).unwrap());
        assert!(!FileLock::exists(&resource));
    }

    #[test]
    fn test_find_locked_resources() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("changesets");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("cs-1.json.lock"), "{}").unwrap();
        fs::write(nested.join("cs-1.json"), "{}").unwrap();

        let resources = FileLock::find_locked_resources(temp.path());
        assert_eq!(resources, vec![nested.join("cs-1.json")]);
    }
}
