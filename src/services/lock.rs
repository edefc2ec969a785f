// Cross-process lock around `.tx/config` mutations
//
// Uses an advisory exclusive lock (flock / LockFileEx via fs2) on an
// ephemeral lock file next to the config. Acquisition polls so it can honor a
// timeout and stay cancellable from async code.

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Delay between lock attempts while another holder owns the lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file name, colocated with `.tx/config`.
pub const LOCK_FILE_NAME: &str = "config.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock {path}")]
    Timeout { path: String, timeout: Duration },

    #[error("Lock file error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Exclusive ownership of the config mutation critical section.
///
/// Dropping the handle removes the lock file and releases the lock, on
/// every exit path including panics and cancelled futures.
#[derive(Debug)]
pub struct LockHandle {
    file: Option<File>,
    path: Utf8PathBuf,
}

impl LockHandle {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Release explicitly; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            // Unlink while still holding the lock so late waiters on the old
            // inode notice it is stale.
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!("Could not remove lock file {}: {}", self.path, e);
                }
            }
            if let Err(e) = FileExt::unlock(&file) {
                tracing::debug!("Could not unlock {}: {}", self.path, e);
            }
            tracing::debug!("Released lock {}", self.path);
        }
    }
}

/// Portable advisory lock acquisition with timeout.
pub struct Locker;

impl Locker {
    /// Lock file path for a given `.tx/config`.
    pub fn lock_path_for(config_path: &Utf8Path) -> Utf8PathBuf {
        match config_path.parent() {
            Some(dir) => dir.join(LOCK_FILE_NAME),
            None => Utf8PathBuf::from(LOCK_FILE_NAME),
        }
    }

    /// Block until the lock at `path` is ours or `timeout` elapses.
    pub async fn acquire(path: &Utf8Path, timeout: Duration) -> Result<LockHandle, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let deadline = Instant::now() + timeout;
        let contended = fs2::lock_contended_error().raw_os_error();

        loop {
            match OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
            {
                Ok(file) => match file.try_lock_exclusive() {
                    Ok(()) => {
                        if refers_to_path(&file, path) {
                            tracing::debug!("Acquired lock {}", path);
                            return Ok(LockHandle {
                                file: Some(file),
                                path: path.to_path_buf(),
                            });
                        }
                        // Previous holder unlinked this inode; retry on the new file
                        drop(file);
                        continue;
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || (contended.is_some() && e.raw_os_error() == contended) => {}
                    Err(e) => return Err(io_err(e)),
                },
                // Windows refuses to open a file whose deletion is pending
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
                Err(e) => return Err(io_err(e)),
            }

            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

#[cfg(unix)]
fn refers_to_path(file: &File, path: &Utf8Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn refers_to_path(_file: &File, path: &Utf8Path) -> bool {
    path.exists()
}
