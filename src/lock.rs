//! Repository lock file.
//!
//! One process may run a `sync`/`scrub`/`check`/`fix` against a repository
//! at a time. The lock file is created if missing and held with an
//! advisory `flock` exclusive lock for the lifetime of the guard, released
//! on every exit path (including panics, via `Drop`). `skip_lock` bypasses
//! acquisition entirely, for tooling that inspects a repository read-only.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub struct RepoLock {
    file: Option<File>,
    path: PathBuf,
}

impl RepoLock {
    /// Acquires the lock at `path`, failing immediately if another process
    /// already holds it rather than blocking — a second concurrent
    /// invocation should fail fast, not queue.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = file.as_raw_fd();
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(RepoLock { file: Some(file), path })
    }

    /// Constructs a no-op guard for `skip_lock`.
    pub fn disabled() -> Self {
        RepoLock { file: None, path: PathBuf::new() }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                let fd = file.as_raw_fd();
                unsafe {
                    libc::flock(fd, libc::LOCK_UN);
                }
            }
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.lock");
        let first = RepoLock::acquire(&path).unwrap();
        let second = RepoLock::acquire(&path);
        assert!(second.is_err());
        drop(first);
        let third = RepoLock::acquire(&path);
        assert!(third.is_ok());
    }

    #[test]
    fn disabled_lock_is_a_no_op() {
        let _guard = RepoLock::disabled();
    }
}
