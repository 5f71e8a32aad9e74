//! Advisory file locks
//!
//! Locks are `flock(LOCK_EX)` on a file that is held open for the guard's
//! lifetime. The kernel drops the lock when the descriptor closes, including
//! when the owning process dies, so a crashed holder never wedges a key.
//! Lock files are never deleted: unlinking a locked path would let the next
//! caller lock a fresh inode while the old holder still runs.
//!
//! A guard that recorded a holder line truncates it again before unlocking,
//! so readers can tell who holds a lock from the file contents alone,
//! without competing for the lock themselves.

use crate::error::{VmgateError, VmgateResult};
use crate::poll::PollSpec;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// RAII guard for an exclusively held lock file
pub struct FileLock {
    file: File,
    path: PathBuf,
    recorded: bool,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileLock {
    /// Try to take the lock without waiting
    pub fn try_acquire(path: &Path) -> VmgateResult<Option<Self>> {
        let file = open_lock_file(path)?;
        match try_flock_exclusive(&file) {
            Ok(true) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
                recorded: false,
            })),
            Ok(false) => Ok(None),
            Err(e) => Err(VmgateError::io(format!("locking {}", path.display()), e)),
        }
    }

    /// Wait for the lock, polling until `timeout` elapses
    pub async fn acquire(
        path: &Path,
        key: &str,
        interval: Duration,
        timeout: Duration,
    ) -> VmgateResult<Self> {
        let file = open_lock_file(path)?;
        let spec = PollSpec::new(interval, timeout);

        let locked = spec
            .until_true("file lock", || {
                let result = try_flock_exclusive(&file)
                    .map_err(|e| VmgateError::io(format!("locking {}", path.display()), e));
                async move { result }
            })
            .await?;

        if !locked {
            return Err(VmgateError::LockTimeout {
                key: key.to_string(),
                waited_secs: spec.timeout_secs(),
            });
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            recorded: false,
        })
    }

    /// Replace the lock file contents with a holder description
    pub fn record_holder(&mut self, holder: &str) -> VmgateResult<()> {
        let write = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{} {}", std::process::id(), holder)?;
            file.flush()
        };
        self.recorded = true;
        write(&mut self.file)
            .map_err(|e| VmgateError::io(format!("writing {}", self.path.display()), e))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Still locked here; the descriptor closes after this returns
        if self.recorded {
            if let Err(e) = self.file.set_len(0) {
                warn!("Failed to clear holder of {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Holder recorded in a lock file: pid and free-form purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub purpose: String,
}

impl LockHolder {
    /// Read the holder line from a lock file, if any.
    ///
    /// Never takes the lock. An empty file means nobody holds it; a line
    /// whose pid is gone was left by a holder that died.
    pub fn read(path: &Path) -> Option<Self> {
        let mut content = String::new();
        File::open(path).ok()?.read_to_string(&mut content).ok()?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Option<Self> {
        let line = content.lines().next()?.trim();
        let (pid, purpose) = line.split_once(' ').unwrap_or((line, ""));
        Some(Self {
            pid: pid.parse().ok()?,
            purpose: purpose.to_string(),
        })
    }

    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }
}

fn open_lock_file(path: &Path) -> VmgateResult<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| VmgateError::io(format!("opening lock file {}", path.display()), e))
}

/// Check whether a given PID is alive.
///
/// Uses `kill(pid, 0)` which checks for process existence without sending a
/// signal.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 only checks for process existence.
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if the file is
/// already locked through another open file description.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for this call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
