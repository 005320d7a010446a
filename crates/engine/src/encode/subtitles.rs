//! External subtitle extraction.
//!
//! In `external` subtitle mode each subtitle stream of the ripped file is
//! written next to the encoded output as `<stem>.<lang>.<ext>` before the
//! encode runs. Failures are logged and never abort the disc.

use crate::probe::{MetadataProber, SubtitleStream};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Codecs ffmpeg can convert to SubRip.
const TEXT_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa", "webvtt", "mov_text"];

/// Outcome of extracting one file's subtitle streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtitleSummary {
    pub extracted: usize,
    pub failed: usize,
}

/// Two-letter language code from a stream tag (`eng` -> `en`), or `und`.
pub fn subtitle_language(raw: &str) -> String {
    let letters: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase())
        .take(2)
        .collect();
    if letters.len() == 2 {
        letters
    } else {
        "und".to_string()
    }
}

/// Sidecar format for a codec: file extension plus ffmpeg output flags.
pub fn sidecar_format(codec: &str) -> (&'static str, &'static [&'static str]) {
    let codec = codec.trim().to_lowercase();
    if TEXT_CODECS.contains(&codec.as_str()) {
        ("srt", &["-c:s", "srt"])
    } else if codec == "dvd_subtitle" {
        ("idx", &["-c:s", "copy", "-f", "vobsub"])
    } else {
        ("mks", &["-c:s", "copy", "-f", "matroska"])
    }
}

/// First free path among `<base>.<ext>`, `<base>.02.<ext>` ... `<base>.99.<ext>`.
///
/// Falls back to `<base>.<ext>` when all are taken.
pub fn sidecar_path(base: &Path, ext: &str) -> PathBuf {
    let with_suffix = |suffix: &str| {
        let mut s = base.as_os_str().to_os_string();
        s.push(suffix);
        PathBuf::from(s)
    };
    let first = with_suffix(&format!(".{}", ext));
    if !first.exists() {
        return first;
    }
    (2..100)
        .map(|i| with_suffix(&format!(".{:02}.{}", i, ext)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// ffmpeg command extracting one stream into `out`.
pub fn build_extract_command(input: &Path, stream: &SubtitleStream, out: &Path) -> Command {
    let (_, format_args) = sidecar_format(&stream.codec);
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-nostdin", "-i"])
        .arg(input)
        .arg("-map")
        .arg(format!("0:{}", stream.index))
        .args(format_args)
        .arg(out);
    cmd
}

/// Extract every subtitle stream of `input` next to `video_output`.
pub fn extract_external_subtitles(
    prober: &dyn MetadataProber,
    input: &Path,
    video_output: &Path,
) -> SubtitleSummary {
    extract_with(prober, input, video_output, |cmd| {
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn extract_with(
    prober: &dyn MetadataProber,
    input: &Path,
    video_output: &Path,
    mut run: impl FnMut(&mut Command) -> bool,
) -> SubtitleSummary {
    let input_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let streams = prober.subtitle_streams(input);
    let mut summary = SubtitleSummary::default();

    if streams.is_empty() {
        info!("Subtitle extraction done: {} (no subtitle streams found)", input_name);
        return summary;
    }

    let out_dir = video_output.parent().unwrap_or_else(|| Path::new("."));
    let stem = video_output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let total = streams.len();
    info!("Subtitle extraction start: {} ({} streams)", input_name, total);

    for (i, stream) in streams.iter().enumerate() {
        let base = out_dir.join(format!("{}.{}", stem, subtitle_language(&stream.language)));
        let (ext, _) = sidecar_format(&stream.codec);
        let out = sidecar_path(&base, ext);
        info!(
            "Subtitle extraction progress: {}/{}: {} stream {} -> {}",
            i + 1,
            total,
            input_name,
            stream.index,
            out.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );

        if run(&mut build_extract_command(input, stream, &out)) {
            summary.extracted += 1;
        } else {
            let _ = fs::remove_file(&out);
            summary.failed += 1;
            let codec = if stream.codec.is_empty() {
                "unknown"
            } else {
                stream.codec.as_str()
            };
            warn!("subtitle extraction failed for stream {} ({})", stream.index, codec);
        }
    }

    info!(
        "Subtitle extraction done: {} ({} succeeded, {} failed)",
        input_name, summary.extracted, summary.failed
    );
    summary
}
