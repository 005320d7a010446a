//! Per-title directory layout.
//!
//! A title (one movie, or one season of a series) owns a work directory
//! under the work root holding its ripped MKVs, and an output location in the
//! library where encodes land. Remote destinations are staged inside the
//! work directory and copied during finalization.

use crate::extras_nfo::{init_extras_nfo, EXTRAS_NFO_NAME};
use crate::naming::sanitize_title;
use crate::remote::RemoteDest;
use disc_archiver_config::{Config, OutputContainer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker file identifying a work directory created by this tool.
pub const WORKDIR_MARKER: &str = ".disc_archiver_workdir";

/// Name of the per-title folder holding ripped discs.
pub const MKV_ROOT_NAME: &str = "MKVs";

/// Name of the extras folder below a movie or season folder.
pub const EXTRAS_DIR_NAME: &str = "Extras";

const SERIES_STAGE_DIR: &str = "__series_stage";
const MOVIE_STAGE_DIR: &str = "__movie_stage";

/// Kind of title, as recorded in disc manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Movie => write!(f, "movie"),
            MediaKind::Series => write!(f, "series"),
        }
    }
}

/// Movie or series specific parameters of a title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSpec {
    /// `multi_disc`: discs 2+ hold extras only.
    Movie { multi_disc: bool },
    Series { season: u32 },
}

impl MediaSpec {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaSpec::Movie { .. } => MediaKind::Movie,
            MediaSpec::Series { .. } => MediaKind::Series,
        }
    }
}

/// What the operator said about a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSpec {
    pub title_raw: String,
    /// Four-digit year.
    pub year: String,
    pub media: MediaSpec,
}

/// Where a library lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local(PathBuf),
    Remote(RemoteDest),
}

impl Destination {
    pub fn parse(dest: &str) -> Self {
        match RemoteDest::parse(dest) {
            Some(remote) => Destination::Remote(remote),
            None => Destination::Local(PathBuf::from(dest)),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Destination::Remote(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Destination::Local(p) => Some(p),
            Destination::Remote(_) => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(p) => write!(f, "{}", p.display()),
            Destination::Remote(r) => write!(f, "{}", r),
        }
    }
}

/// Library roots and output container for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLayout {
    pub work_root: PathBuf,
    pub movies: Destination,
    pub series: Destination,
    pub container: OutputContainer,
}

impl LibraryLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_root: config.paths.work_root.clone(),
            movies: Destination::parse(&config.paths.movies_dir),
            series: Destination::parse(&config.paths.series_dir),
            container: config.encode.output_container,
        }
    }

    pub fn any_remote(&self) -> bool {
        self.movies.is_remote() || self.series.is_remote()
    }

    /// Local library roots, for disk space checks.
    pub fn local_roots(&self) -> Vec<PathBuf> {
        [&self.movies, &self.series]
            .into_iter()
            .filter_map(|d| d.local_path().map(Path::to_path_buf))
            .collect()
    }
}

/// Output location of a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleOutputs {
    Movie { movie_dir: PathBuf, main_file: PathBuf },
    Series { season_dir: PathBuf },
}

/// Resolved paths and flags for one title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleContext {
    pub title_raw: String,
    /// Sanitized folder name.
    pub title: String,
    pub year: String,
    pub media: MediaSpec,
    /// Two-digit season, empty for movies.
    pub season_pad: String,
    pub work_dir: PathBuf,
    pub mkv_root: PathBuf,
    pub outputs: TitleOutputs,
    pub extras_dir: PathBuf,
    pub extras_nfo: PathBuf,
    /// Set when finished output must be copied to a remote host.
    pub remote: Option<RemoteDest>,
    /// Output file extension without the dot.
    pub extension: &'static str,
}

impl TitleContext {
    /// Compute every path for a title without touching the filesystem.
    pub fn resolve(spec: &TitleSpec, layout: &LibraryLayout) -> Self {
        let title = sanitize_title(&spec.title_raw);
        let folder = format!("{} ({})", title, spec.year);
        let work_dir = layout.work_root.join(&folder);
        let mkv_root = work_dir.join(MKV_ROOT_NAME);
        let extension = layout.container.extension();

        let (season_pad, outputs, remote) = match spec.media {
            MediaSpec::Series { season } => {
                let season_pad = format!("{:02}", season);
                let season_folder = format!("Season {}", season_pad);
                let (base, remote) = match &layout.series {
                    Destination::Local(root) => (root.join(&title), None),
                    Destination::Remote(r) => {
                        (work_dir.join(SERIES_STAGE_DIR).join(&title), Some(r.clone()))
                    }
                };
                let season_dir = base.join(season_folder);
                (season_pad, TitleOutputs::Series { season_dir }, remote)
            }
            MediaSpec::Movie { .. } => {
                let (movie_dir, remote) = match &layout.movies {
                    Destination::Local(root) => (root.join(&folder), None),
                    Destination::Remote(r) => {
                        (work_dir.join(MOVIE_STAGE_DIR).join(&folder), Some(r.clone()))
                    }
                };
                let main_file = movie_dir.join(format!("{}.{}", title, extension));
                (
                    String::new(),
                    TitleOutputs::Movie {
                        movie_dir,
                        main_file,
                    },
                    remote,
                )
            }
        };

        let extras_dir = outputs.root().join(EXTRAS_DIR_NAME);
        let extras_nfo = extras_dir.join(EXTRAS_NFO_NAME);

        Self {
            title_raw: spec.title_raw.clone(),
            title,
            year: spec.year.clone(),
            media: spec.media,
            season_pad,
            work_dir,
            mkv_root,
            outputs,
            extras_dir,
            extras_nfo,
            remote,
            extension,
        }
    }

    /// Resolve paths and create the directories, marker and extras sidecar.
    pub fn setup(spec: &TitleSpec, layout: &LibraryLayout) -> io::Result<Self> {
        let ctx = Self::resolve(spec, layout);
        fs::create_dir_all(&ctx.mkv_root)?;
        fs::write(ctx.work_dir.join(WORKDIR_MARKER), b"")?;
        fs::create_dir_all(&ctx.extras_dir)?;
        init_extras_nfo(&ctx.extras_nfo)?;
        Ok(ctx)
    }

    pub fn kind(&self) -> MediaKind {
        self.media.kind()
    }

    pub fn is_series(&self) -> bool {
        self.kind() == MediaKind::Series
    }

    pub fn is_multi_disc(&self) -> bool {
        matches!(self.media, MediaSpec::Movie { multi_disc: true })
    }

    /// Deduplication key for the finalize batch.
    pub fn batch_key(&self) -> String {
        match self.media {
            MediaSpec::Series { .. } => {
                format!("S|{}|{}|{}", self.title, self.year, self.season_pad)
            }
            MediaSpec::Movie { .. } => format!("M|{}|{}", self.title, self.year),
        }
    }

    /// Directory for ripped disc `disc` (1-based).
    pub fn disc_dir(&self, disc: u32) -> PathBuf {
        self.mkv_root.join(disc_dir_name(disc))
    }

    pub fn main_file(&self) -> Option<&Path> {
        match &self.outputs {
            TitleOutputs::Movie { main_file, .. } => Some(main_file),
            TitleOutputs::Series { .. } => None,
        }
    }

    pub fn season_dir(&self) -> Option<&Path> {
        match &self.outputs {
            TitleOutputs::Series { season_dir } => Some(season_dir),
            TitleOutputs::Movie { .. } => None,
        }
    }

    /// `"<title> (<year>)"` for log lines.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.title, self.year)
    }
}

impl TitleOutputs {
    /// Movie folder or season folder.
    pub fn root(&self) -> &Path {
        match self {
            TitleOutputs::Movie { movie_dir, .. } => movie_dir,
            TitleOutputs::Series { season_dir } => season_dir,
        }
    }
}

/// `Disc01`, `Disc02`, ...
pub fn disc_dir_name(disc: u32) -> String {
    format!("Disc{:02}", disc)
}

/// Whether `work_dir` sits exactly one level below `root`.
///
/// Guards every recursive delete. Both paths are canonicalized, so a
/// missing path or a symlink escaping the root is rejected.
pub fn is_safe_work_dir(root: &Path, work_dir: &Path) -> bool {
    let (Ok(root), Ok(work_dir)) = (root.canonicalize(), work_dir.canonicalize()) else {
        return false;
    };
    work_dir != root && work_dir.parent() == Some(root.as_path())
}
