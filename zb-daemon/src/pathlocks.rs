// SPDX-License-Identifier: MIT

//! Filesystem locks guarding store paths.
//!
//! A path `<p>` is protected by an exclusive `flock()` on `<p>.lock`,
//! so coordination survives across processes (a second daemon pointed
//! at the same store, future garbage collection). The lock is released
//! on drop.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

pub struct PathLock {
    _flock: Flock<File>,
    lock_path: PathBuf,
}

impl PathLock {
    /// Acquire an exclusive lock on `path`, blocking until available.
    /// Creates `<path>.lock` as needed.
    pub fn lock(path: &Path) -> io::Result<Self> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::other(format!("flock failed: {errno}")))?;

        Ok(PathLock {
            _flock: flock,
            lock_path,
        })
    }

    /// Remove the lock file. Called after the guarded path is in its
    /// final state; other processes blocked on the lock proceed once we
    /// drop.
    pub fn cleanup(self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}
