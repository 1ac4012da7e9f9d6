//! Advisory file locking using `flock(2)` on Unix and `LockFileEx` on Windows,
//! with a bounded wait.
//!
//! [`FileLock`] holds an exclusive lock on a `.lock` sentinel beside the
//! protected file and releases it on drop. Every acquisition opens its own file
//! description, so the lock excludes other threads of this process as well as
//! other processes sharing the store.

use crate::error::{CaError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// RAII advisory file lock.
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Acquire the lock for `path`, polling until `timeout` elapses.
    ///
    /// # Errors
    /// * `LockTimeout` - the lock stayed held by someone else for the whole wait
    /// * `Io` - the sentinel file could not be opened or locked
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                tracing::warn!(path = %path.display(), ?timeout, "lock wait expired");
                return Err(CaError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// Returns `Ok(None)` if the lock is held elsewhere.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path_for(path))?;
        match flock_try_exclusive(&file) {
            Ok(true) => Ok(Some(Self { _file: file })),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        flock_unlock(&self._file);
    }
}

/// `.lock` sentinel path for a given file path.
pub(crate) fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_os_string();
    lock.push(".lock");
    lock.into()
}

#[cfg(unix)]
fn flock_try_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(true)
    } else {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(unix)]
fn flock_unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
}

#[cfg(windows)]
const WHOLE_FILE_LOCK_LEN: u32 = u32::MAX;

#[cfg(windows)]
fn whole_file_overlapped() -> windows_sys::Win32::System::IO::OVERLAPPED {
    use windows_sys::Win32::System::IO::{OVERLAPPED, OVERLAPPED_0, OVERLAPPED_0_0};
    OVERLAPPED {
        Anonymous: OVERLAPPED_0 {
            Anonymous: OVERLAPPED_0_0 {
                Offset: 0,
                OffsetHigh: 0,
            },
        },
        ..Default::default()
    }
}

#[cfg(windows)]
fn flock_try_exclusive(file: &File) -> io::Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, ERROR_SHARING_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let mut overlapped = whole_file_overlapped();
    let rc = unsafe {
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            WHOLE_FILE_LOCK_LEN,
            WHOLE_FILE_LOCK_LEN,
            &mut overlapped,
        )
    };
    if rc != 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code)
            if code == ERROR_LOCK_VIOLATION as i32 || code == ERROR_SHARING_VIOLATION as i32 =>
        {
            Ok(false)
        }
        _ => Err(err),
    }
}

#[cfg(windows)]
fn flock_unlock(file: &File) {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;

    let handle = file.as_raw_handle() as HANDLE;
    // Region must match the one passed to LockFileEx
    let mut overlapped = whole_file_overlapped();
    unsafe {
        let _ = UnlockFileEx(
            handle,
            0,
            WHOLE_FILE_LOCK_LEN,
            WHOLE_FILE_LOCK_LEN,
            &mut overlapped,
        );
    }
}

#[cfg(not(any(unix, windows)))]
compile_error!("file locking is only implemented for unix and windows targets");
