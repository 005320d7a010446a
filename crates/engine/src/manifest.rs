//! Disc manifest persistence.
//!
//! The first time a disc is processed its execution plan is written to
//! `.disc_manifest.json` inside the disc directory. Later runs reuse that
//! plan verbatim, so output names never drift across restarts.

use crate::title::MediaKind;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// File name of the manifest inside a disc directory.
pub const MANIFEST_FILE_NAME: &str = ".disc_manifest.json";

/// Current manifest schema version. Any other version is ignored on load.
pub const MANIFEST_VERSION: u32 = 1;

/// Role of a planned output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanItemKind {
    Main,
    Episode,
    Extra,
}

/// One planned encode: ripped input to library output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    #[serde(rename = "type")]
    pub kind: PlanItemKind,
    /// Input path relative to the disc directory.
    pub input_rel: String,
    /// Absolute output path.
    pub output: PathBuf,
}

impl PlanItem {
    pub fn new(kind: PlanItemKind, input_rel: impl Into<String>, output: PathBuf) -> Self {
        Self {
            kind,
            input_rel: input_rel.into(),
            output,
        }
    }

    /// Absolute input path given the disc directory.
    pub fn input_path(&self, disc_dir: &Path) -> PathBuf {
        disc_dir.join(&self.input_rel)
    }
}

/// Persisted execution plan for one disc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscManifest {
    pub version: u32,
    pub kind: MediaKind,
    pub title: String,
    pub year: String,
    /// Two-digit season, empty for movies.
    #[serde(default)]
    pub season: String,
    pub disc_dir: PathBuf,
    pub items: Vec<PlanItem>,
    /// Unix seconds.
    pub created_at: i64,
}

impl DiscManifest {
    pub fn new(
        kind: MediaKind,
        title: &str,
        year: &str,
        season: &str,
        disc_dir: &Path,
        items: Vec<PlanItem>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            kind,
            title: title.to_string(),
            year: year.to_string(),
            season: season.to_string(),
            disc_dir: disc_dir.to_path_buf(),
            items,
            created_at: current_timestamp_secs(),
        }
    }

    /// True when the plan is non-empty and every output exists.
    pub fn is_complete(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.output.exists())
    }

    /// Items whose output does not exist yet.
    pub fn missing_items(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(|item| !item.output.exists())
    }
}

fn current_timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Manifest path for a disc directory.
pub fn manifest_path(disc_dir: &Path) -> PathBuf {
    disc_dir.join(MANIFEST_FILE_NAME)
}

/// Load a disc's manifest.
///
/// Returns `None` when the file is missing, unreadable, not valid JSON,
/// or written by a different schema version.
pub fn load_manifest(disc_dir: &Path) -> Option<DiscManifest> {
    let path = manifest_path(disc_dir);
    let content = fs::read_to_string(&path).ok()?;
    let value: Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring unreadable manifest {}: {}", path.display(), e);
            return None;
        }
    };

    match value.get("version").and_then(Value::as_u64) {
        Some(v) if v == u64::from(MANIFEST_VERSION) => serde_json::from_value(value)
            .map_err(|e| warn!("Ignoring malformed manifest {}: {}", path.display(), e))
            .ok(),
        other => {
            warn!(
                "Ignoring manifest {} with unsupported version {:?}",
                path.display(),
                other
            );
            None
        }
    }
}

/// Atomically write a disc's manifest.
///
/// The JSON goes to a `.tmp` sibling, is flushed to disk, and is then renamed
/// into place, so a crash never leaves a truncated manifest behind.
pub fn write_manifest(disc_dir: &Path, manifest: &DiscManifest) -> io::Result<()> {
    fs::create_dir_all(disc_dir)?;
    let path = manifest_path(disc_dir);
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut json = serde_json::to_string_pretty(manifest)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    json.push('\n');

    let mut file = File::create(&tmp)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &path)?;

    // Persist the rename itself. Not every filesystem allows syncing a directory.
    if let Ok(dir) = File::open(disc_dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}
