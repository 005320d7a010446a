//! Removal of ripped MKVs and work directories.
//!
//! Every recursive delete goes through [`is_safe_work_dir`]: only direct
//! children of the work root are ever removed.

use crate::extras_nfo::EXTRAS_NFO_NAME;
use crate::title::{is_safe_work_dir, LibraryLayout, EXTRAS_DIR_NAME, MKV_ROOT_NAME, WORKDIR_MARKER};
use log::{error, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Legacy series staging folder name that also marks a work directory.
const LEGACY_SERIES_STAGE: &str = "__series_stage";

/// Error type for cleanup operations
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Refusing to remove {what}; unsafe work dir: {}", path.display())]
    Unsafe { what: &'static str, path: PathBuf },

    #[error("Failed to remove {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn remove_tree(path: &Path) -> Result<(), CleanupError> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).map_err(|source| CleanupError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Delete a title's `MKVs/` tree unless MKVs are being kept.
pub fn remove_mkvs_if_allowed(
    work_root: &Path,
    work_dir: &Path,
    mkv_root: &Path,
    keep_mkvs: bool,
) -> Result<(), CleanupError> {
    if keep_mkvs {
        info!("--keep-mkvs: leaving MKVs intact: {}", mkv_root.display());
        return Ok(());
    }
    if !is_safe_work_dir(work_root, work_dir) {
        return Err(CleanupError::Unsafe {
            what: "MKV tree",
            path: work_dir.to_path_buf(),
        });
    }
    remove_tree(mkv_root)
}

/// Delete a title's work directory unless MKVs are being kept.
pub fn remove_work_dir_if_allowed(
    work_root: &Path,
    work_dir: &Path,
    keep_mkvs: bool,
) -> Result<(), CleanupError> {
    if keep_mkvs {
        info!("--keep-mkvs: leaving work dir intact: {}", work_dir.display());
        return Ok(());
    }
    if !is_safe_work_dir(work_root, work_dir) {
        return Err(CleanupError::Unsafe {
            what: "work dir",
            path: work_dir.to_path_buf(),
        });
    }
    remove_tree(work_dir)
}

/// Total size of regular files below `dir`. Unreadable entries count as 0.
pub fn dir_size_bytes(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// `512 B`, `1.5 KB`, `3.2 GB`, ...
pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut v = n as f64;
    for (i, unit) in UNITS.iter().enumerate() {
        if v < 1024.0 || i == UNITS.len() - 1 {
            return if i == 0 {
                format!("{} {}", n, unit)
            } else {
                format!("{:.1} {}", v, unit)
            };
        }
        v /= 1024.0;
    }
    format!("{} B", n)
}

/// A work directory eligible for `--cleanup-mkvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCandidate {
    pub work_dir: PathBuf,
    pub mkv_root: PathBuf,
    /// Carries the work-dir marker (as opposed to a legacy hint).
    pub managed: bool,
}

fn is_inside(path: &Path, root: &Path) -> bool {
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(p), Ok(r)) => p.starts_with(r),
        _ => false,
    }
}

/// Work directories under the work root that this tool created.
///
/// A candidate has `MKVs/` plus either the work-dir marker or a legacy hint
/// (`Extras/extras.nfo` or `__series_stage`), passes [`is_safe_work_dir`],
/// and does not live inside a local library root.
pub fn find_cleanup_candidates(layout: &LibraryLayout) -> io::Result<Vec<CleanupCandidate>> {
    let library_roots = layout.local_roots();
    let mut candidates = Vec::new();

    for entry in fs::read_dir(&layout.work_root)? {
        let work_dir = entry?.path();
        if !work_dir.is_dir() {
            continue;
        }
        let mkv_root = work_dir.join(MKV_ROOT_NAME);
        if !mkv_root.is_dir() {
            continue;
        }
        let managed = work_dir.join(WORKDIR_MARKER).exists();
        let legacy = work_dir.join(EXTRAS_DIR_NAME).join(EXTRAS_NFO_NAME).exists()
            || work_dir.join(LEGACY_SERIES_STAGE).exists();
        if !managed && !legacy {
            continue;
        }
        if !is_safe_work_dir(&layout.work_root, &work_dir) {
            continue;
        }
        if library_roots.iter().any(|root| is_inside(&work_dir, root)) {
            continue;
        }
        candidates.push(CleanupCandidate {
            work_dir,
            mkv_root,
            managed,
        });
    }

    candidates.sort_by(|a, b| a.work_dir.cmp(&b.work_dir));
    Ok(candidates)
}

/// `--cleanup-mkvs`: list candidate MKV folders and delete them.
///
/// Returns the exit code: 0 on success or dry run, 1 if any deletion failed,
/// 2 if the work root cannot be read.
pub fn cleanup_mkvs(layout: &LibraryLayout, dry_run: bool) -> i32 {
    let candidates = match find_cleanup_candidates(layout) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "unable to read work directory {}: {}",
                layout.work_root.display(),
                e
            );
            return 2;
        }
    };

    if candidates.is_empty() {
        info!("No managed MKV folders found to clean.");
        info!("Hint: only work directories created by this tool are eligible for cleanup.");
        return 0;
    }

    info!("MKV cleanup candidates:");
    let mut total = 0;
    for c in &candidates {
        let size = dir_size_bytes(&c.mkv_root);
        total += size;
        let tag = if c.managed { "managed" } else { "legacy" };
        info!("  - {} ({}) [{}]", c.mkv_root.display(), human_bytes(size), tag);
    }
    info!("Total candidates: {}", candidates.len());
    info!("Total size: {}", human_bytes(total));

    if dry_run {
        info!("Dry run: nothing deleted.");
        return 0;
    }

    let mut deleted = 0;
    let mut failed = 0;
    for c in &candidates {
        match remove_tree(&c.mkv_root) {
            Ok(()) => deleted += 1,
            Err(e) => {
                failed += 1;
                error!("{}", e);
            }
        }
    }
    info!("Deleted MKV folders: {}", deleted);
    if failed > 0 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::Destination;
    use disc_archiver_config::OutputContainer;
    use tempfile::TempDir;

    fn layout(root: &Path) -> LibraryLayout {
        LibraryLayout {
            work_root: root.to_path_buf(),
            movies: Destination::Local(root.join("Movies")),
            series: Destination::parse("nas:/srv/Series"),
            container: OutputContainer::Mp4,
        }
    }

    fn work_dir(root: &Path, name: &str, marker: bool) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(dir.join(MKV_ROOT_NAME).join("Disc01")).unwrap();
        fs::write(dir.join(MKV_ROOT_NAME).join("Disc01").join("t.mkv"), vec![0u8; 2048]).unwrap();
        if marker {
            fs::write(dir.join(WORKDIR_MARKER), b"").unwrap();
        }
        dir
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_keep_mkvs_leaves_everything() {
        let root = TempDir::new().unwrap();
        let dir = work_dir(root.path(), "Heat (1995)", true);
        let mkvs = dir.join(MKV_ROOT_NAME);
        remove_mkvs_if_allowed(root.path(), &dir, &mkvs, true).unwrap();
        remove_work_dir_if_allowed(root.path(), &dir, true).unwrap();
        assert!(mkvs.is_dir());
    }

    #[test]
    fn test_unsafe_dir_refused() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        let err = remove_work_dir_if_allowed(root.path(), &nested, false).unwrap_err();
        assert!(matches!(err, CleanupError::Unsafe { .. }));
        assert!(nested.is_dir());

        remove_mkvs_if_allowed(root.path(), &root.path().join("a"), &nested, false).unwrap();
        assert!(!nested.exists());
    }

    #[test]
    fn test_candidates_and_delete() {
        let root = TempDir::new().unwrap();
        let managed = work_dir(root.path(), "Heat (1995)", true);
        let unmarked = work_dir(root.path(), "Random", false);
        let legacy = work_dir(root.path(), "Old (2001)", false);
        fs::create_dir_all(legacy.join(LEGACY_SERIES_STAGE)).unwrap();
        let l = layout(root.path());

        let found = find_cleanup_candidates(&l).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].work_dir, managed);
        assert!(found[0].managed);
        assert_eq!(found[1].work_dir, legacy);
        assert!(!found[1].managed);

        assert_eq!(cleanup_mkvs(&l, true), 0);
        assert!(managed.join(MKV_ROOT_NAME).exists());

        assert_eq!(cleanup_mkvs(&l, false), 0);
        assert!(!managed.join(MKV_ROOT_NAME).exists());
        assert!(!legacy.join(MKV_ROOT_NAME).exists());
        assert!(managed.join(WORKDIR_MARKER).exists());
        assert!(unmarked.join(MKV_ROOT_NAME).exists());
    }

    #[test]
    fn test_library_dirs_excluded() {
        let root = TempDir::new().unwrap();
        let movie = work_dir(root.path(), "Movies", true);
        let found = find_cleanup_candidates(&layout(root.path())).unwrap();
        assert!(found.iter().all(|c| c.work_dir != movie));
    }

    #[test]
    fn test_unreadable_root_exit_code() {
        let root = TempDir::new().unwrap();
        let mut l = layout(root.path());
        l.work_root = root.path().join("missing");
        assert_eq!(cleanup_mkvs(&l, true), 2);
    }
}
