//! Store directory locking
//!
//! Every read-modify-write of a file-backed store happens under an
//! exclusive advisory lock on `<store>/.strand_store.lock`. This is what
//! makes "claim if due and unleased" atomic across processes sharing one
//! store directory.
//!
//! - Configurable timeout
//! - Contention logging
//! - Automatic release on drop

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("store lock timeout after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Advisory lock over a store directory.
///
/// Released when dropped.
pub struct StoreLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl StoreLock {
    /// Lock file name
    const LOCK_FILENAME: &'static str = ".strand_store.lock";

    /// Acquire the lock on `store_dir`, waiting up to `timeout`.
    ///
    /// Creates the directory and lock file if they don't exist.
    pub fn acquire(store_dir: &Path, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(store_dir)?;

        let lock_path = store_dir.join(Self::LOCK_FILENAME);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(5);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(&lock_path) {
                Ok(file) => {
                    if warned {
                        tracing::debug!(
                            path = %lock_path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "store lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        tracing::warn!(path = %lock_path.display(), "store lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }

            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(lock_path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    /// Non-Unix fallback: exclusive creation of the lock file.
    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    /// Get the lock file path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquire_basic() {
        let temp_dir = TempDir::new().unwrap();
        let lock = StoreLock::acquire(temp_dir.path(), Duration::from_secs(1)).unwrap();

        assert!(lock.path().exists());
        assert!(lock.path().file_name().unwrap() == ".strand_store.lock");
    }

    #[test]
    fn test_lock_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = temp_dir.path().join("nested").join("store");

        let _lock = StoreLock::acquire(&store_dir, Duration::from_secs(1)).unwrap();

        assert!(store_dir.exists());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();

        {
            let _lock = StoreLock::acquire(temp_dir.path(), Duration::from_secs(1)).unwrap();
        }

        let _again = StoreLock::acquire(temp_dir.path(), Duration::from_secs(1)).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_lock_contention_times_out() {
        use std::sync::mpsc;
        use std::thread;

        let temp_dir = TempDir::new().unwrap();
        let store_dir = temp_dir.path().to_path_buf();
        let store_dir2 = store_dir.clone();

        let held = StoreLock::acquire(&store_dir, Duration::from_secs(1)).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let result = StoreLock::acquire(&store_dir2, Duration::from_millis(100));
            tx.send(matches!(result, Err(LockError::Timeout(_)))).unwrap();
        });

        assert!(rx.recv().unwrap(), "second acquisition should time out");
        handle.join().unwrap();
        drop(held);
    }
}
