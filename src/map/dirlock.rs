//! # Directory Lock
//!
//! Advisory exclusive lock on the map's `multimap.lock` sentinel file,
//! held for the whole lifetime of an open map so at most one process has
//! the directory open. The file's existence alone means nothing — only a
//! held `flock` does — so a crashed process never wedges the directory.
//!
//! The file carries the owning process id, purely for debugging.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::error::{report, ErrorKind};

/// Held directory lock; released when dropped (or when the process dies).
pub struct DirectoryLock {
    _file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Creates the sentinel if needed and takes the exclusive lock
    /// without blocking. A busy lock reports `locked`.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;

        try_lock_exclusive(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                report(
                    ErrorKind::Locked,
                    format!("map directory lock '{}' is held", path.display()),
                )
            } else {
                eyre::Report::new(e)
                    .wrap_err(format!("failed to lock '{}'", path.display()))
            }
        })?;

        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    // No advisory locking on this platform; single-process use assumed.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use tempfile::tempdir;

    #[test]
    fn lock_file_records_process_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multimap.lock");
        let lock = DirectoryLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_in_child_process_fails() {
        // flock is per open file description, so a second lock in the
        // same process would succeed; fork to observe the conflict.
        let dir = tempdir().unwrap();
        let path = dir.path().join("multimap.lock");
        let _lock = DirectoryLock::acquire(&path).unwrap();

        match unsafe { libc::fork() } {
            0 => {
                // Child: the lock must be busy.
                let busy = DirectoryLock::acquire(&path).is_err();
                unsafe { libc::_exit(if busy { 0 } else { 1 }) };
            }
            pid if pid > 0 => {
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
                assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
            }
            _ => panic!("fork failed"),
        }
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multimap.lock");
        drop(DirectoryLock::acquire(&path).unwrap());
        let again = DirectoryLock::acquire(&path).unwrap();
        drop(again);
    }

    #[test]
    fn stale_lock_file_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multimap.lock");
        std::fs::write(&path, "99999\n").unwrap();
        // Existence alone does not mean locked.
        let lock = DirectoryLock::acquire(&path);
        assert!(lock.is_ok(), "{:?}", lock.err().map(|e| kind_of(&e)));
    }
}
