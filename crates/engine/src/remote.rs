//! Remote library destinations reached over SSH.
//!
//! A destination string of the form `host:/path` is remote; finished titles
//! are staged locally and copied with `scp -r` during finalization.

use crate::process::output_with_timeout;
use log::{info, warn};
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a single short remote command such as `mkdir` or `test`.
pub const REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for remote operations
#[derive(Debug, Error)]
pub enum RemoteError {
    /// A remote command exited unsuccessfully
    #[error("Remote command failed on {host}: {command} (exit {code:?})")]
    CommandFailed {
        host: String,
        command: String,
        code: Option<i32>,
    },

    /// The remote directory could not be created or is not writable
    #[error("Remote directory is not writable: {0}\nHint: ensure SSH keys/auth are set up and the remote path is valid.")]
    NotWritable(String),

    /// A movie folder with the same name already exists remotely
    #[error("Remote already has: {0}\nRefusing to overwrite. Remove it remotely or choose a different destination.")]
    AlreadyExists(String),

    /// Failed to launch ssh/scp
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Whether a destination string names a remote `host:path`.
///
/// Absolute and explicitly relative paths are local, and so is anything that
/// looks like a URL.
pub fn is_remote_dest(dest: &str) -> bool {
    !dest.is_empty()
        && dest.contains(':')
        && !dest.starts_with('/')
        && !dest.starts_with("./")
        && !dest.starts_with("../")
        && !dest.contains("://")
}

/// A parsed `host:path` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDest {
    pub host: String,
    pub path: String,
}

impl RemoteDest {
    /// Parse a destination, returning `None` for local paths.
    pub fn parse(dest: &str) -> Option<Self> {
        if !is_remote_dest(dest) {
            return None;
        }
        let (host, path) = dest.split_once(':')?;
        Some(Self {
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    /// Remote path of `sub` below this destination.
    pub fn join(&self, sub: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), sub)
    }
}

impl fmt::Display for RemoteDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Transport used to reach remote destinations.
pub trait RemoteTransport: Send + Sync {
    /// Run `command` through the remote shell; `Ok(false)` on non-zero exit.
    fn exec(&self, host: &str, command: &str) -> Result<bool, RemoteError>;

    /// Recursively copy `local_dir` into `remote_dir` on `host`.
    fn copy_dir_into(&self, local_dir: &Path, host: &str, remote_dir: &str)
        -> Result<(), RemoteError>;
}

/// [`RemoteTransport`] using the system `ssh` and `scp` in batch mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTransport;

impl RemoteTransport for SshTransport {
    fn exec(&self, host: &str, command: &str) -> Result<bool, RemoteError> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10", host, command]);
        let output = output_with_timeout(&mut cmd, REMOTE_COMMAND_TIMEOUT).map_err(|source| {
            RemoteError::Spawn {
                program: "ssh",
                source,
            }
        })?;
        match output {
            Some(output) => Ok(output.status.success()),
            None => {
                warn!("ssh command timed out on {}: {}", host, command);
                Ok(false)
            }
        }
    }

    fn copy_dir_into(
        &self,
        local_dir: &Path,
        host: &str,
        remote_dir: &str,
    ) -> Result<(), RemoteError> {
        let target = format!("{}:{}/", host, remote_dir.trim_end_matches('/'));
        let status = Command::new("scp")
            .arg("-r")
            .arg(local_dir)
            .arg(&target)
            .status()
            .map_err(|source| RemoteError::Spawn {
                program: "scp",
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(RemoteError::CommandFailed {
                host: host.to_string(),
                command: format!("scp -r {} {}", local_dir.display(), target),
                code: status.code(),
            })
        }
    }
}

fn exec_checked(
    transport: &dyn RemoteTransport,
    host: &str,
    command: String,
) -> Result<(), RemoteError> {
    if transport.exec(host, &command)? {
        Ok(())
    } else {
        Err(RemoteError::CommandFailed {
            host: host.to_string(),
            command,
            code: None,
        })
    }
}

/// Create the remote base directory and check it is writable.
pub fn preflight_dir(transport: &dyn RemoteTransport, dest: &RemoteDest) -> Result<(), RemoteError> {
    let path = shell_quote(&dest.path);
    let ok = transport.exec(&dest.host, &format!("mkdir -p -- {}", path))?
        && transport.exec(
            &dest.host,
            &format!("test -d -- {p} && test -w -- {p}", p = path),
        )?;
    if ok {
        Ok(())
    } else {
        Err(RemoteError::NotWritable(dest.to_string()))
    }
}

/// Whether `sub` exists below the destination.
pub fn remote_exists(
    transport: &dyn RemoteTransport,
    dest: &RemoteDest,
    sub: &str,
) -> Result<bool, RemoteError> {
    transport.exec(&dest.host, &format!("test -e -- {}", shell_quote(&dest.join(sub))))
}

/// Copy a finished movie folder into the destination.
///
/// `local_movie_dir` must already be named `<title> (<year>)`. Refuses to
/// overwrite an existing remote folder of that name.
pub fn sync_movie_folder(
    transport: &dyn RemoteTransport,
    dest: &RemoteDest,
    title: &str,
    year: &str,
    local_movie_dir: &Path,
) -> Result<(), RemoteError> {
    let folder = format!("{} ({})", title, year);
    if remote_exists(transport, dest, &folder)? {
        return Err(RemoteError::AlreadyExists(format!("{}/{}", dest, folder)));
    }
    info!("Copying movie folder to remote: {}", dest);
    transport.copy_dir_into(local_movie_dir, &dest.host, &dest.path)
}

/// Copy a staged season folder into `<dest>/<title>/`.
pub fn sync_series_season(
    transport: &dyn RemoteTransport,
    dest: &RemoteDest,
    title: &str,
    local_season_dir: &Path,
) -> Result<(), RemoteError> {
    let series_dir = dest.join(title);
    exec_checked(
        transport,
        &dest.host,
        format!("mkdir -p -- {}", shell_quote(&series_dir)),
    )?;
    info!("Copying season folder to remote: {}/{}", dest, title);
    transport.copy_dir_into(local_season_dir, &dest.host, &series_dir)
}
