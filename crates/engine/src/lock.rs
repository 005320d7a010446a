//! Per-output encode locks.
//!
//! A lock is a sibling file `<output>.enc.lock` created exclusively before an
//! encode starts. It holds the PID of the process doing the work; a lock
//! whose PID no longer exists is stale and gets reclaimed.

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Suffix appended to an output path to form its lock path.
pub const LOCK_SUFFIX: &str = ".enc.lock";

/// A lock without a PID younger than this is assumed to be mid-creation.
const FRESH_LOCK_GRACE: Duration = Duration::from_secs(5);

/// Error type for lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock
    #[error("Output is locked (encode in progress?): {path}\nIf this is stale, remove: {path}")]
    Locked { path: PathBuf },

    /// IO error while creating or writing the lock
    #[error("Failed to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lock path for an output file.
pub fn encode_lock_path(output: &Path) -> PathBuf {
    let mut s = output.as_os_str().to_os_string();
    s.push(LOCK_SUFFIX);
    PathBuf::from(s)
}

/// Whether a process with `pid` currently exists.
///
/// A process owned by another user still counts as alive.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// PID recorded on the first line of a lock file, if any.
pub fn read_lock_pid(lock: &Path) -> Option<u32> {
    let content = fs::read_to_string(lock).ok()?;
    content.lines().next()?.trim().parse().ok()
}

/// Returns `true` when `lock` is absent or was stale and has been removed.
///
/// Returns `false` only when the lock names a live process. A lock with no
/// readable PID is treated as stale.
pub fn lock_is_stale_or_clear(lock: &Path) -> bool {
    if !lock.exists() {
        return true;
    }
    match read_lock_pid(lock) {
        Some(pid) if pid_is_alive(pid) => return false,
        Some(_) => {}
        // The creator may not have written its PID yet.
        None if is_fresh(lock) => return false,
        None => {}
    }
    debug!("Removing stale lock: {}", lock.display());
    if let Err(e) = fs::remove_file(lock) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove stale lock {}: {}", lock.display(), e);
        }
    }
    true
}

fn is_fresh(lock: &Path) -> bool {
    fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age < FRESH_LOCK_GRACE)
        .unwrap_or(false)
}

/// Whether `output` is currently locked by a live process.
pub fn output_is_locked(output: &Path) -> bool {
    !lock_is_stale_or_clear(&encode_lock_path(output))
}

/// Held encode lock. Removing the lock file happens on drop.
#[derive(Debug)]
pub struct EncodeLock {
    path: PathBuf,
}

impl EncodeLock {
    /// Exclusively create the lock for `output`, reclaiming a stale one first.
    ///
    /// The lock initially records this process's PID.
    ///
    /// # Errors
    /// [`LockError::Locked`] if a live process already holds it.
    pub fn acquire(output: &Path) -> Result<Self, LockError> {
        let path = encode_lock_path(output);
        lock_is_stale_or_clear(&path);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Locked { path });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };

        // The guard exists before the write so a failed write still cleans up.
        let lock = Self { path };
        writeln!(file, "{}", std::process::id()).map_err(|source| LockError::Io {
            path: lock.path.clone(),
            source,
        })?;
        Ok(lock)
    }

    /// Replace the recorded PID, e.g. with the encoder child's PID.
    pub fn record_pid(&self, pid: u32) -> io::Result<()> {
        fs::write(&self.path, format!("{}\n", pid))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EncodeLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}
