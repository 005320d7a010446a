//! Free disk space gate.
//!
//! Long CSV runs pause before each next disc when any filesystem holding
//! MKVs or encoded outputs drops below the configured floor.

use crate::operator::Operator;
use crate::title::LibraryLayout;
use log::warn;
use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of free-space figures.
pub trait SpaceProbe {
    /// Bytes available to unprivileged users on the filesystem holding
    /// `path`, or `None` if unknown.
    fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// [`SpaceProbe`] backed by `sysinfo`'s mounted disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpace;

impl SpaceProbe for SystemSpace {
    fn free_bytes(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Local paths whose filesystems a run writes to: the work root plus any
/// local library roots.
pub fn disk_targets(layout: &LibraryLayout) -> Vec<PathBuf> {
    let mut targets = vec![layout.work_root.clone()];
    targets.extend(layout.local_roots());
    targets
}

/// Keep the first path per device. Paths that cannot be inspected are kept.
pub fn dedupe_by_device(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .filter(|p| match std::fs::metadata(p) {
            Ok(meta) => seen.insert(meta.dev()),
            Err(_) => true,
        })
        .cloned()
        .collect()
}

/// Paths below `min_free_gb`, with their free space in GiB.
pub fn low_space(probe: &dyn SpaceProbe, paths: &[PathBuf], min_free_gb: u64) -> Vec<(PathBuf, f64)> {
    let floor = min_free_gb.max(1) as f64;
    paths
        .iter()
        .filter_map(|p| {
            let free_gb = probe.free_bytes(p)? as f64 / GIB;
            (free_gb < floor).then(|| (p.clone(), free_gb))
        })
        .collect()
}

/// Block until every target has at least `min_free_gb` free.
///
/// Each failed check asks the operator to free space and confirm.
pub fn pause_if_low_disk_space(
    probe: &dyn SpaceProbe,
    operator: &dyn Operator,
    paths: &[PathBuf],
    min_free_gb: u64,
) -> io::Result<()> {
    let targets = dedupe_by_device(paths);
    if targets.is_empty() {
        return Ok(());
    }
    loop {
        let low = low_space(probe, &targets, min_free_gb);
        if low.is_empty() {
            return Ok(());
        }
        warn!("Low disk space detected. Please free up space on the server.");
        for (path, free_gb) in &low {
            warn!(
                "  - {}: {:.1} GB free (need >= {} GB)",
                path.display(),
                free_gb,
                min_free_gb.max(1)
            );
        }
        operator.confirm(
            "Low disk space: free up space and Press Enter to retry.\n\
             Note: cleanup does not run while a job is running, because background \
             encodes may still be reading MKVs from the work directory.",
        )?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::testing::ScriptedOperator;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Reports `low` bytes for the first `low_calls` queries, then plenty.
    struct FakeSpace {
        calls: Cell<usize>,
        low_calls: usize,
    }

    impl SpaceProbe for FakeSpace {
        fn free_bytes(&self, _path: &Path) -> Option<u64> {
            let n = self.calls.get();
            self.calls.set(n + 1);
            Some(if n < self.low_calls { 5 << 30 } else { 500 << 30 })
        }
    }

    #[test]
    fn test_dedupe_same_device() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        let missing = dir.path().join("missing");

        let unique = dedupe_by_device(&[a.clone(), b, missing.clone()]);
        assert_eq!(unique, vec![a, missing]);
    }

    #[test]
    fn test_low_space_threshold() {
        let probe = FakeSpace {
            calls: Cell::new(0),
            low_calls: 1,
        };
        let paths = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let low = low_space(&probe, &paths, 20);
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].0, PathBuf::from("/a"));
        assert!((low[0].1 - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_pause_waits_for_operator() {
        let dir = TempDir::new().unwrap();
        let probe = FakeSpace {
            calls: Cell::new(0),
            low_calls: 2,
        };
        let op = ScriptedOperator::new(&[]);
        pause_if_low_disk_space(&probe, &op, &[dir.path().to_path_buf()], 20).unwrap();
        assert_eq!(op.prompts().len(), 2);
    }
}
