//! Media metadata probing.
//!
//! Every probe is total: a failed or timed-out `ffprobe` reports a zero
//! duration, zero chapters or an empty title instead of an error. Callers
//! treat those values as "unknown" rather than aborting a disc.

use crate::process::{output_with_timeout, stdout_text};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Upper bound on a single ffprobe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

static DURATION_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)?$").expect("valid regex"));

/// Probe results for one ripped file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFacts {
    /// Whole seconds; 0 when the probe failed.
    pub duration_seconds: u64,
    pub chapter_count: u32,
    /// Description tag, falling back to the title tag. May be empty.
    pub title_tag: String,
}

/// A ripped file together with its probe results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub facts: MediaFacts,
    pub size_bytes: u64,
}

impl MediaFile {
    /// File name as UTF-8 (lossy).
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Size in whole mebibytes.
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / (1024 * 1024)
    }
}

/// A subtitle stream reported by the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleStream {
    pub index: u32,
    pub codec: String,
    /// Raw language tag, possibly empty.
    pub language: String,
}

/// Source of media metadata.
///
/// Implemented by [`FfprobeProber`] in production and by in-memory fakes in
/// tests.
pub trait MetadataProber: Send + Sync {
    fn duration_seconds(&self, path: &Path) -> u64;
    fn chapter_count(&self, path: &Path) -> u32;
    fn meta_title(&self, path: &Path) -> String;

    /// Subtitle streams in the file. Empty when unknown.
    fn subtitle_streams(&self, _path: &Path) -> Vec<SubtitleStream> {
        Vec::new()
    }
}

/// Probe a single file through `prober`.
pub fn probe_file(prober: &dyn MetadataProber, path: &Path) -> MediaFile {
    let facts = MediaFacts {
        duration_seconds: prober.duration_seconds(path),
        chapter_count: prober.chapter_count(path),
        title_tag: prober.meta_title(path),
    };
    let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    debug!(
        "Probed {}: {}s, {} chapters, title '{}'",
        path.display(),
        facts.duration_seconds,
        facts.chapter_count,
        facts.title_tag
    );
    MediaFile {
        path: path.to_path_buf(),
        facts,
        size_bytes,
    }
}

/// Parse the first line of `format=duration` output into whole seconds.
///
/// Anything that is not a plain non-negative decimal yields 0.
pub fn parse_duration_seconds(raw: &str) -> u64 {
    let first = raw.lines().next().unwrap_or("").trim();
    if !DURATION_VALUE.is_match(first) {
        return 0;
    }
    first
        .split('.')
        .next()
        .and_then(|whole| whole.parse().ok())
        .unwrap_or(0)
}

/// Count non-blank lines of `chapters=chapter` CSV output.
pub fn parse_chapter_count(raw: &str) -> u32 {
    raw.lines().filter(|l| !l.trim().is_empty()).count() as u32
}

#[derive(Debug, Deserialize)]
struct StreamsDocument {
    #[serde(default)]
    streams: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    index: u32,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    tags: Option<StreamTags>,
}

#[derive(Debug, Deserialize)]
struct StreamTags {
    #[serde(default)]
    language: String,
}

/// Parse `ffprobe -show_streams -print_format json` output.
pub fn parse_subtitle_streams(json: &str) -> Vec<SubtitleStream> {
    serde_json::from_str::<StreamsDocument>(json)
        .map(|doc| {
            doc.streams
                .into_iter()
                .map(|s| SubtitleStream {
                    index: s.index,
                    codec: s.codec_name,
                    language: s.tags.map(|t| t.language).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// [`MetadataProber`] backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    timeout: Duration,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl FfprobeProber {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn run(&self, args: &[&str], path: &Path) -> String {
        let mut cmd = Command::new("ffprobe");
        cmd.args(["-v", "error"]).args(args).arg(path);
        match output_with_timeout(&mut cmd, self.timeout) {
            Ok(Some(output)) => stdout_text(&output),
            Ok(None) => {
                debug!("ffprobe timed out on {}", path.display());
                String::new()
            }
            Err(e) => {
                debug!("ffprobe failed on {}: {}", path.display(), e);
                String::new()
            }
        }
    }

    fn format_tag(&self, tag: &str, path: &Path) -> String {
        let entry = format!("format_tags={}", tag);
        self.run(
            &[
                "-show_entries",
                &entry,
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ],
            path,
        )
    }
}

impl MetadataProber for FfprobeProber {
    fn duration_seconds(&self, path: &Path) -> u64 {
        parse_duration_seconds(&self.run(
            &[
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ],
            path,
        ))
    }

    fn chapter_count(&self, path: &Path) -> u32 {
        parse_chapter_count(&self.run(
            &["-show_entries", "chapters=chapter", "-of", "csv=p=0"],
            path,
        ))
    }

    fn meta_title(&self, path: &Path) -> String {
        let description = self.format_tag("description", path);
        if !description.is_empty() {
            return description;
        }
        self.format_tag("title", path)
    }

    fn subtitle_streams(&self, path: &Path) -> Vec<SubtitleStream> {
        parse_subtitle_streams(&self.run(
            &[
                "-select_streams",
                "s",
                "-show_streams",
                "-print_format",
                "json",
            ],
            path,
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeProber;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_seconds("2603.456000\n"), 2603);
        assert_eq!(parse_duration_seconds("42"), 42);
        assert_eq!(parse_duration_seconds(""), 0);
        assert_eq!(parse_duration_seconds("N/A"), 0);
        assert_eq!(parse_duration_seconds("-5.0"), 0);
    }

    #[test]
    fn test_parse_chapter_count() {
        assert_eq!(parse_chapter_count("0.000,300.0\n300.0,600.0\n\n"), 2);
        assert_eq!(parse_chapter_count(""), 0);
    }

    #[test]
    fn test_parse_subtitle_streams() {
        let json = r#"{
            "streams": [
                {"index": 3, "codec_name": "dvd_subtitle", "tags": {"language": "eng"}},
                {"index": 4, "codec_name": "subrip"}
            ]
        }"#;
        let streams = parse_subtitle_streams(json);
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].codec, "dvd_subtitle");
        assert_eq!(streams[0].language, "eng");
        assert_eq!(streams[1].index, 4);
        assert_eq!(streams[1].language, "");
    }

    #[test]
    fn test_parse_subtitle_streams_garbage() {
        assert!(parse_subtitle_streams("not json").is_empty());
        assert!(parse_subtitle_streams("").is_empty());
    }

    #[test]
    fn test_probe_file_reads_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("title_t00.mkv");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let prober = FakeProber::default().with("title_t00.mkv", 2600, 10, "Pilot");
        let file = probe_file(&prober, &path);

        assert_eq!(file.size_bytes, 2048);
        assert_eq!(file.facts.duration_seconds, 2600);
        assert_eq!(file.facts.chapter_count, 10);
        assert_eq!(file.facts.title_tag, "Pilot");
        assert_eq!(file.file_name(), "title_t00.mkv");
    }

    #[test]
    fn test_probe_missing_file_is_total() {
        let prober = FakeProber::default();
        let file = probe_file(&prober, Path::new("/nonexistent/x.mkv"));
        assert_eq!(file.size_bytes, 0);
        assert_eq!(file.facts, MediaFacts::default());
    }
}
