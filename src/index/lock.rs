//! Advisory lock on the store directory, shared by every imgfacet process.
//!
//! A `watch` process and one-shot CLI commands may write the same store. Each
//! write takes an exclusive flock() for its duration, so commits from different
//! processes are serialized and each one starts from the latest catalog.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the store directory
pub const LOCK_FILE: &str = "imgfacet.lock";

/// A held store lock that releases on drop
pub struct StoreLock {
    #[allow(dead_code)]
    file: File,
}

impl StoreLock {
    /// Acquire the exclusive lock on `dir`, blocking until it is available.
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;

        Self::lock_exclusive(&file)?;

        Ok(StoreLock { file })
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> io::Result<()> {
        // No cross-process locking on this platform
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for StoreLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
