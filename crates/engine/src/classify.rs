//! Classifier module for separating main content from bonus material.
//!
//! A ripped file is an *extra* when it is short and either carries a bonus
//! keyword in its title tag or has almost no chapters. Everything else is a
//! feature or episode candidate. The module also picks the main feature of a
//! movie disc and orders series files into likely episode order.

use crate::probe::{MediaFacts, MediaFile};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Files at or above this many seconds are never extras.
pub const EXTRA_DURATION_THRESHOLD: u64 = 1200;

/// Short files with this many chapters or fewer count as extras.
pub const EXTRA_MAX_CHAPTERS: u32 = 2;

/// Title-tag keywords that mark bonus material.
static EXTRA_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)extra|deleted|featurette|behind|interview|trailer|bonus|promo")
        .expect("valid regex")
});

static EPISODE_HINTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bS\d{1,2}E(\d{1,3})\b",
        r"(?i)\bE(?:P(?:ISODE)?)?\s*[-_. ]?(\d{1,3})\b",
        r"(?i)\b\d{1,2}x(\d{1,3})\b",
        r"(?i)\bPART\s*(\d{1,3})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static SOURCE_TITLE_HINTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:^|[^a-z])t(?:itle)?[_\- ]?(\d{1,3})(?:[^a-z]|$)",
        r"(?i)\btitle[_\- ]?(\d{1,3})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static DIGIT_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").expect("valid regex"));

/// Decide whether a probed file is bonus material.
///
/// A file with an unknown (zero) duration is never an extra.
pub fn is_extra(facts: &MediaFacts) -> bool {
    let short = facts.duration_seconds > 0 && facts.duration_seconds < EXTRA_DURATION_THRESHOLD;
    if !short {
        return false;
    }
    EXTRA_KEYWORDS.is_match(&facts.title_tag) || facts.chapter_count <= EXTRA_MAX_CHAPTERS
}

/// Result of classifying every file on a disc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationResult {
    /// `(path, is_extra)` in input order.
    pub entries: Vec<(PathBuf, bool)>,
    /// Longest non-extra, or the largest file when every file is an extra.
    /// `None` only for an empty input.
    pub main_file: Option<PathBuf>,
}

impl ClassificationResult {
    pub fn is_extra(&self, path: &Path) -> bool {
        self.entries
            .iter()
            .any(|(p, extra)| *extra && p.as_path() == path)
    }

    pub fn extras(&self) -> impl Iterator<Item = &Path> {
        self.entries
            .iter()
            .filter(|(_, extra)| *extra)
            .map(|(p, _)| p.as_path())
    }
}

/// Classify a disc's files and choose its main feature.
///
/// Non-extras are ranked by duration; a file whose duration could not be
/// probed is ranked by its size in MiB instead. Ties go to the earlier file.
pub fn classify(files: &[MediaFile]) -> ClassificationResult {
    let entries: Vec<(PathBuf, bool)> = files
        .iter()
        .map(|f| (f.path.clone(), is_extra(&f.facts)))
        .collect();

    let main_by_rank = first_max_by_key(
        files.iter().zip(&entries).filter(|(_, (_, extra))| !extra),
        |(f, _)| rank_value(f),
    )
    .map(|(f, _)| f.path.clone());

    let main_file =
        main_by_rank.or_else(|| first_max_by_key(files.iter(), |f| f.size_bytes).map(|f| f.path.clone()));

    ClassificationResult { entries, main_file }
}

fn rank_value(file: &MediaFile) -> u64 {
    if file.facts.duration_seconds > 0 {
        file.facts.duration_seconds
    } else {
        file.size_mb()
    }
}

/// Like `Iterator::max_by_key` but keeps the first of equal maxima.
fn first_max_by_key<I, T, F>(iter: I, key: F) -> Option<T>
where
    I: Iterator<Item = T>,
    F: Fn(&T) -> u64,
{
    iter.fold(None, |best: Option<(u64, T)>, item| {
        let k = key(&item);
        match best {
            Some((bk, b)) if bk >= k => Some((bk, b)),
            _ => Some((k, item)),
        }
    })
    .map(|(_, item)| item)
}

/// Episode number hinted by a title tag such as `S01E03`, `Episode 4`,
/// `2x05` or `Part 2`.
pub fn episode_hint(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    EPISODE_HINTS.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .filter(|n| (1..=999).contains(n))
    })
}

/// MakeMKV title index hinted by a file name such as `title_t02.mkv`.
pub fn source_title_hint(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_string_lossy();
    SOURCE_TITLE_HINTS.iter().find_map(|re| {
        re.captures(&stem)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
    })
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalPart {
    Number(u64),
    Text(String),
}

/// Sort key that orders `t2` before `t10`.
fn natural_key(text: &str) -> Vec<NaturalPart> {
    DIGIT_RUNS
        .find_iter(text)
        .map(|m| {
            let s = m.as_str();
            match s.parse::<u64>() {
                Ok(n) if s.bytes().all(|b| b.is_ascii_digit()) => NaturalPart::Number(n),
                _ => NaturalPart::Text(s.to_lowercase()),
            }
        })
        .collect()
}

/// Order files for episode numbering.
///
/// Files whose title tag hints an episode number come first, by that
/// number; then files by MakeMKV title index; then natural file-name order.
pub fn plan_order(mut files: Vec<MediaFile>) -> Vec<MediaFile> {
    files.sort_by(|a, b| compare_for_plan(a, b));
    files
}

fn compare_for_plan(a: &MediaFile, b: &MediaFile) -> Ordering {
    let key = |f: &MediaFile| {
        let ep = episode_hint(&f.facts.title_tag);
        (
            ep.is_none(),
            ep.unwrap_or(10_000),
            source_title_hint(&f.path).unwrap_or(10_000),
            natural_key(&f.file_name()),
        )
    };
    key(a).cmp(&key(b))
}
