//! Advisory lock on an engine directory.
//!
//! The lock is a POSIX record lock (`fcntl(F_SETLK)`) over all of
//! `<dir>/LOCK`. Record locks belong to the process, so a forked child does
//! not hold its parent's lock and cannot keep the directory locked after the
//! parent closes the engine. Because the kernel would let the same process
//! take the lock twice, locks held by this process are also tracked in
//! [`HELD`]; a second handle on the same directory fails with `WouldBlock`.
//!
//! Closing any descriptor of a locked file drops a record lock, so the lock
//! file is only ever opened after the in-process check has passed.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use parking_lot::{const_mutex, Mutex};

pub const LOCK_FILE: &str = "LOCK";

/// Canonical lock file paths held by this process
static HELD: Mutex<Vec<PathBuf>> = const_mutex(Vec::new());

pub struct DirLock {
    file: Option<File>,
    path: PathBuf,
}

impl DirLock {
    /// Lock `dir`. Fails with `WouldBlock` if another handle holds it.
    /// The lock file contains the holder's process ID for debugging.
    pub fn acquire(dir: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::fs::canonicalize(dir.as_ref())?.join(LOCK_FILE);

        let mut held = HELD.lock();
        if held.contains(&path) {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "directory is already locked by this process",
            ));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        lock_whole_file(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        held.push(path.clone());
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Close under the registry lock so a new holder never sees its lock
        // dropped by our close
        let mut held = HELD.lock();
        self.file.take();
        held.retain(|p| p != &self.path);
    }
}

fn lock_whole_file(file: &File) -> io::Result<()> {
    // SAFETY: a zeroed flock is a valid value; the fields that matter are set below
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = 0;

    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock as *const libc::flock) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails_until_drop() {
        let dir = TempDir::new().unwrap();
        let first = DirLock::acquire(dir.path()).unwrap();
        let content = std::fs::read_to_string(first.path()).unwrap();
        assert!(content.contains(&std::process::id().to_string()));

        let err = DirLock::acquire(dir.path()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        drop(first);
        assert!(DirLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_same_dir_through_other_path_is_locked() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("epoch")).unwrap();
        let _first = DirLock::acquire(dir.path().join("epoch")).unwrap();
        assert!(DirLock::acquire(dir.path().join("epoch").join("..").join("epoch")).is_err());
    }

    #[test]
    fn test_forked_child_does_not_keep_lock() {
        let dir = TempDir::new().unwrap();
        let first = DirLock::acquire(dir.path()).unwrap();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            std::thread::sleep(std::time::Duration::from_millis(500));
            unsafe { libc::_exit(0) };
        }

        drop(first);
        let relocked = DirLock::acquire(dir.path());
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(relocked.is_ok());
    }
}
