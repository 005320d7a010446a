//! Startup checks
//!
//! Preflight checks run before any disc is touched:
//! - Required external tools are on `PATH`
//! - Local library directories exist and are writable
//! - Remote library destinations accept writes over SSH

use crate::remote::{preflight_dir, RemoteError, RemoteTransport};
use crate::title::{Destination, LibraryLayout};
use log::{error, info};
use nix::unistd::{access, AccessFlags};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Tools every run needs.
pub const BASE_TOOLS: &[&str] = &["ffprobe", "ffmpeg", "HandBrakeCLI", "makemkvcon", "eject"];

/// Extra tools needed when a library destination is remote.
pub const REMOTE_TOOLS: &[&str] = &["ssh", "scp"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Missing required command: {tool}\nInstall hint (Debian): {hint}")]
    MissingTool { tool: String, hint: String },

    #[error("{label} directory not found: {}", path.display())]
    DirNotFound { label: &'static str, path: PathBuf },

    #[error("{label} directory not writable: {}", path.display())]
    DirNotWritable { label: &'static str, path: PathBuf },

    #[error("Could not create work directory {}: {source}", path.display())]
    WorkRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Failed to run HandBrakeCLI --preset-list: {0}")]
    Presets(#[source] io::Error),
}

impl StartupError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::MissingTool { .. } => 127,
            _ => 2,
        }
    }
}

/// Debian install hint for a missing command.
pub fn install_hint(cmd: &str) -> String {
    match cmd {
        "ffmpeg" | "ffprobe" => "sudo apt-get update && sudo apt-get install -y ffmpeg".to_string(),
        "HandBrakeCLI" => "sudo apt-get update && sudo apt-get install -y handbrake-cli".to_string(),
        "eject" => "sudo apt-get update && sudo apt-get install -y eject".to_string(),
        "ssh" | "scp" => "sudo apt-get update && sudo apt-get install -y openssh-client".to_string(),
        "makemkvcon" => "Install MakeMKV (makemkvcon) from MakeMKV upstream or a trusted \
                         third-party Debian repo; it is often not in Debian main."
            .to_string(),
        other => format!(
            "Install the package that provides '{}' (distribution-specific).",
            other
        ),
    }
}

/// Tools this layout needs, in check order.
pub fn required_tools(layout: &LibraryLayout) -> Vec<&'static str> {
    let mut tools = BASE_TOOLS.to_vec();
    if layout.any_remote() {
        tools.extend_from_slice(REMOTE_TOOLS);
    }
    tools
}

/// Resolve `tool` on `PATH`.
pub fn find_tool(tool: &str) -> Option<PathBuf> {
    which::which(tool).ok()
}

/// Fail on the first tool that `lookup` cannot resolve.
pub fn check_required_tools<F>(tools: &[&str], lookup: F) -> Result<(), StartupError>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    match tools.iter().find(|t| lookup(t).is_none()) {
        Some(tool) => Err(StartupError::MissingTool {
            tool: tool.to_string(),
            hint: install_hint(tool),
        }),
        None => Ok(()),
    }
}

/// One line of the `--check-deps` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub tool: &'static str,
    pub path: Option<PathBuf>,
}

/// Status of every tool, found or not.
pub fn tool_report<F>(tools: &[&'static str], lookup: F) -> Vec<ToolStatus>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    tools
        .iter()
        .map(|&tool| ToolStatus {
            tool,
            path: lookup(tool),
        })
        .collect()
}

/// Log the dependency report and return the exit code (0 or 2).
pub fn check_deps(layout: &LibraryLayout) -> i32 {
    let report = tool_report(&required_tools(layout), find_tool);
    let mut missing = 0;
    for status in &report {
        match &status.path {
            Some(path) => info!("OK: {} -> {}", status.tool, path.display()),
            None => {
                missing += 1;
                error!("MISSING: {}", status.tool);
                info!("  Install hint (Debian): {}", install_hint(status.tool));
            }
        }
    }
    if missing == 0 {
        info!("All dependencies found.");
        0
    } else {
        error!("{} required command(s) missing.", missing);
        2
    }
}

/// A local library directory must exist and be writable.
pub fn check_local_dir(label: &'static str, path: &Path) -> Result<(), StartupError> {
    if !path.is_dir() {
        return Err(StartupError::DirNotFound {
            label,
            path: path.to_path_buf(),
        });
    }
    if access(path, AccessFlags::W_OK).is_err() {
        return Err(StartupError::DirNotWritable {
            label,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Check every storage location a run writes to.
///
/// The work root is created if missing. Remote destinations are created
/// and probed over SSH.
pub fn preflight_storage(
    layout: &LibraryLayout,
    transport: &dyn RemoteTransport,
) -> Result<(), StartupError> {
    fs::create_dir_all(&layout.work_root).map_err(|source| StartupError::WorkRoot {
        path: layout.work_root.clone(),
        source,
    })?;
    check_local_dir("Work", &layout.work_root)?;

    for (label, dest) in [("Movies", &layout.movies), ("Series", &layout.series)] {
        match dest {
            Destination::Local(path) => check_local_dir(label, path)?,
            Destination::Remote(remote) => {
                info!("Checking remote {} destination: {}", label.to_lowercase(), remote);
                preflight_dir(transport, remote)?;
            }
        }
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Required tools
/// 2. Storage locations
pub fn run_startup_checks(
    layout: &LibraryLayout,
    transport: &dyn RemoteTransport,
) -> Result<(), StartupError> {
    check_required_tools(&required_tools(layout), find_tool)?;
    preflight_storage(layout, transport)
}

/// Print HandBrake's preset list and return its exit code.
pub fn list_presets() -> Result<i32, StartupError> {
    if find_tool("HandBrakeCLI").is_none() {
        return Err(StartupError::MissingTool {
            tool: "HandBrakeCLI".to_string(),
            hint: install_hint("HandBrakeCLI"),
        });
    }
    let status = Command::new("HandBrakeCLI")
        .arg("--preset-list")
        .status()
        .map_err(StartupError::Presets)?;
    Ok(status.code().unwrap_or(1))
}
