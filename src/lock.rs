//! Advisory locking of the data directory.
//!
//! Only one process may write indices and the catalog at a time:
//! - Daemon: takes the lock on startup and holds it for its lifetime
//! - CLI commands that mutate state take it for the duration of the command
//! - Read-only CLI commands do not lock

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "tagrec.lock";

/// A held file lock that releases on drop
pub struct DataDirLock {
    #[allow(dead_code)]
    file: File,
}

impl DataDirLock {
    /// Fails immediately with `WouldBlock` if another process holds the lock.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        Self::try_lock_exclusive(&file)?;

        Ok(DataDirLock { file })
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "data directory is locked by another tagrec process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for DataDirLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = DataDirLock::try_acquire(dir.path());
        assert!(first.is_ok());

        let second = DataDirLock::try_acquire(dir.path());
        assert_eq!(second.err().unwrap().kind(), io::ErrorKind::WouldBlock);

        drop(first);
        assert!(DataDirLock::try_acquire(dir.path()).is_ok());
    }
}
