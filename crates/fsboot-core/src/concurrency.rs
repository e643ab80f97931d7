use crate::{CoreError, EXIT_INTERRUPTED};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Exclusive startup lock: a marker file holding the owner's PID.
///
/// The marker also carries an advisory `flock`, which the kernel drops when
/// the owning process dies. A marker whose flock can be taken is therefore
/// stale and is reclaimed on the spot. Dropping the guard removes the marker.
pub struct StartupLock {
    lock_file: File,
    path: PathBuf,
}

/// Markers held by this process, so a forced exit can still remove them.
static HELD_LOCKS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

const RECHECK_ATTEMPTS: usize = 3;

impl StartupLock {
    /// Wait up to `timeout` for the lock, polling every `poll`.
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> Result<Self, CoreError> {
        let started = Instant::now();
        let mut announced = false;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }

            let holder = holder_label(Self::holder(path));
            if started.elapsed() >= timeout {
                return Err(CoreError::LockTimeout {
                    path: path.display().to_string(),
                    waited_secs: timeout.as_secs(),
                    holder,
                });
            }
            if !announced {
                info!(
                    "startup lock {} is held by {holder}, waiting up to {}s",
                    path.display(),
                    timeout.as_secs()
                );
                announced = true;
            }
            if shutdown_requested() {
                return Err(CoreError::Interrupted);
            }
            interruptible_sleep(poll.min(timeout.saturating_sub(started.elapsed())));
        }
    }

    /// Single non-blocking attempt. `Ok(None)` means another live process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, CoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..RECHECK_ATTEMPTS {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            if file.try_lock_exclusive().is_err() {
                return Ok(None);
            }

            // The previous owner may have unlinked the marker between our open and lock.
            if !refers_to(&file, path)? {
                debug!("startup lock {} was replaced while locking, retrying", path.display());
                continue;
            }

            let mut previous = String::new();
            file.read_to_string(&mut previous)?;
            if let Some(pid) = parse_pid(&previous) {
                if pid != std::process::id() {
                    warn!(
                        "reclaiming stale startup lock {} left by pid {pid}",
                        path.display()
                    );
                }
            }

            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;

            register(path);
            debug!("acquired startup lock {}", path.display());
            return Ok(Some(Self {
                lock_file: file,
                path: path.to_path_buf(),
            }));
        }
        Ok(None)
    }

    /// Whether a live process holds the lock. Never creates, rewrites, or
    /// removes the marker.
    pub fn is_held(path: &Path) -> Result<bool, CoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if FileExt::try_lock_shared(&file).is_err() {
            return Ok(true);
        }
        let _ = FileExt::unlock(&file);
        Ok(false)
    }

    /// PID recorded in the marker at `path`, if any.
    pub fn holder(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok().and_then(|s| parse_pid(&s))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        // Unlink before unlocking; waiters verify the inode after they lock.
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("released startup lock {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove startup lock {}: {e}", self.path.display()),
        }
        unregister(&self.path);
        let _ = FileExt::unlock(&self.lock_file);
    }
}

fn refers_to(file: &File, path: &Path) -> Result<bool, CoreError> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse().ok()
}

fn holder_label(pid: Option<u32>) -> String {
    pid.map_or_else(|| "an unknown process".to_owned(), |p| format!("pid {p}"))
}

fn register(path: &Path) {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        held.push(path.to_path_buf());
    }
}

fn unregister(path: &Path) {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        held.retain(|p| p != path);
    }
}

/// Remove every marker this process still holds. Safe to call repeatedly.
pub fn release_held_locks() {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        for path in held.drain(..) {
            let _ = fs::remove_file(path);
        }
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First SIGINT/SIGTERM/SIGHUP asks the run to stop before the next stage;
/// a second one removes held lock markers and exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            release_held_locks();
            std::process::exit(EXIT_INTERRUPTED);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current stage...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Sleep for `duration`, returning early once shutdown has been requested.
pub fn interruptible_sleep(duration: Duration) {
    sleep_until_stopped(duration, shutdown_requested);
}

/// A duration past the clock's range never elapses; only `stop` ends it.
fn sleep_until_stopped(duration: Duration, stop: impl Fn() -> bool) {
    let deadline = Instant::now().checked_add(duration);
    loop {
        if stop() {
            return;
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return;
                }
                SLEEP_SLICE.min(deadline - now)
            }
            None => SLEEP_SLICE,
        };
        std::thread::sleep(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_drop_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("startup.lock");

        {
            let _lock = StartupLock::try_acquire(&lock_path).unwrap().unwrap();
            assert!(lock_path.exists());
            assert_eq!(StartupLock::holder(&lock_path), Some(std::process::id()));
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("startup.lock");

        let _lock = StartupLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(StartupLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn release_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("startup.lock");

        let lock = StartupLock::try_acquire(&lock_path).unwrap().unwrap();
        lock.release();
        assert!(StartupLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("startup.lock");

        let _lock = StartupLock::try_acquire(&lock_path).unwrap().unwrap();
        let started = Instant::now();
        let err = StartupLock::acquire(
            &lock_path,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        assert!(err.to_string().contains(&std::process::id().to_string()));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn stale_marker_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("startup.lock");
        // A marker left by a dead process: content but no flock.
        fs::write(&lock_path, "999999\n").unwrap();

        let lock = StartupLock::try_acquire(&lock_path).unwrap();
        assert!(lock.is_some());
        assert_eq!(StartupLock::holder(&lock_path), Some(std::process::id()));
    }

    #[test]
    fn is_held_leaves_marker_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("startup.lock");
        assert!(!StartupLock::is_held(&lock_path).unwrap());
        assert!(!lock_path.exists());

        fs::write(&lock_path, "999999\n").unwrap();
        assert!(!StartupLock::is_held(&lock_path).unwrap());
        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "999999\n");

        fs::remove_file(&lock_path).unwrap();
        let _lock = StartupLock::try_acquire(&lock_path).unwrap().unwrap();
        assert!(StartupLock::is_held(&lock_path).unwrap());
        assert_eq!(StartupLock::holder(&lock_path), Some(std::process::id()));
    }

    #[test]
    fn holder_of_missing_marker_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(StartupLock::holder(&dir.path().join("nope.lock")), None);
    }

    #[test]
    fn interruptible_sleep_waits_full_duration() {
        let started = Instant::now();
        interruptible_sleep(Duration::from_millis(150));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn unrepresentable_sleep_waits_for_stop() {
        let checks = std::cell::Cell::new(0);
        sleep_until_stopped(Duration::MAX, || {
            checks.set(checks.get() + 1);
            checks.get() > 2
        });
        assert_eq!(checks.get(), 3);
    }

    #[test]
    fn stop_ends_sleep_early() {
        let started = Instant::now();
        sleep_until_stopped(Duration::from_secs(60), || true);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
