//! Progress events and tool output parsing.
//!
//! External tools report progress in their own formats: HandBrake rewrites a
//! single line with carriage returns, MakeMKV emits `PRGV:` records. This
//! module turns those streams into whole lines, throttles repetitive
//! progress lines, and renders the text protocol a front end can parse.

use log::{error, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::time::{Duration, Instant};

/// Minimum spacing between two progress lines with the same whole percent.
pub const PROGRESS_MIN_INTERVAL: Duration = Duration::from_secs(2);

static HANDBRAKE_PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Encoding:.*?\s*([0-9]{1,3}(?:\.[0-9]+)?)\s*%").expect("valid regex")
});

static MAKEMKV_PRGV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PRGV:(\d+),(\d+),(\d+)").expect("valid regex"));

/// Pipeline phase a progress value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Rip,
    Encode,
}

/// Typed events behind the line protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress { phase: Phase, percent: f32 },
    /// The operator must act (insert a disc, free space, ...).
    Prompt(String),
    EncodeQueued { name: String },
    EncodeStarted { started: u64, queued: u64, name: String },
    EncodeDone { finished: u64, queued: u64, name: String },
    Finalizing { title: String },
    Done,
    Error(String),
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Progress {
                phase: Phase::Rip,
                percent,
            } => write!(f, "MakeMKV progress: {:5.1}%", percent),
            ProgressEvent::Progress {
                phase: Phase::Encode,
                percent,
            } => write!(f, "Encoding: {:.2} %", percent),
            ProgressEvent::Prompt(text) => write!(f, "{}", text),
            ProgressEvent::EncodeQueued { name } => write!(f, "Queued encode: {}", name),
            ProgressEvent::EncodeStarted {
                started,
                queued,
                name,
            } => write!(f, "HandBrake start: {}/{}: {}", started, queued, name),
            ProgressEvent::EncodeDone {
                finished,
                queued,
                name,
            } => write!(f, "HandBrake done: {}/{}: {}", finished, queued, name),
            ProgressEvent::Finalizing { title } => write!(f, "Finalizing: {}", title),
            ProgressEvent::Done => write!(f, "Processing complete."),
            ProgressEvent::Error(message) => write!(f, "{}", message),
        }
    }
}

/// Log an event as one protocol line. Errors go through the error level so
/// the formatter prefixes them with `ERROR:`.
pub fn emit(event: &ProgressEvent) {
    match event {
        ProgressEvent::Error(_) => error!("{}", event),
        _ => info!("{}", event),
    }
}

/// Splits a byte stream into lines on `\r` or `\n`.
///
/// Blank lines are dropped and surrounding whitespace is trimmed.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.buf.push(b);
            }
        }
        lines
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Percent value of a HandBrake `Encoding: ... NN.NN %` line.
pub fn parse_handbrake_percent(line: &str) -> Option<f32> {
    HANDBRAKE_PERCENT
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Overall percent of a MakeMKV `PRGV:current,total,max` record.
pub fn parse_makemkv_prgv(line: &str) -> Option<f32> {
    let caps = MAKEMKV_PRGV.captures(line.trim())?;
    let total: f64 = caps.get(2)?.as_str().parse().ok()?;
    let max: f64 = caps.get(3)?.as_str().parse().ok()?;
    if max <= 0.0 {
        return None;
    }
    Some(((total / max) * 100.0).clamp(0.0, 100.0) as f32)
}

/// Whether a MakeMKV line is a progress record the console should not see raw.
pub fn is_makemkv_progress_record(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("PRGV:") || line.starts_with("PRGC:") || line.starts_with("PRGT:")
}

/// Rate limiter for progress lines.
///
/// A progress line passes when its whole percent differs from the last one
/// emitted or [`PROGRESS_MIN_INTERVAL`] has elapsed. Non-progress lines always
/// pass.
#[derive(Debug)]
pub struct ProgressThrottle {
    last_percent: Option<u32>,
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_MIN_INTERVAL)
    }
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_percent: None,
            last_emit: None,
            min_interval,
        }
    }

    /// Decide for a percent value observed at `now`.
    pub fn should_emit_percent(&mut self, percent: f32, now: Instant) -> bool {
        let whole = percent.max(0.0) as u32;
        let interval_passed = self
            .last_emit
            .map(|t| now.saturating_duration_since(t) >= self.min_interval)
            .unwrap_or(true);
        if self.last_percent != Some(whole) || interval_passed {
            self.last_percent = Some(whole);
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }

    /// Decide for a HandBrake output line observed at `now`.
    pub fn should_emit_line(&mut self, line: &str, now: Instant) -> bool {
        match parse_handbrake_percent(line) {
            Some(percent) => self.should_emit_percent(percent, now),
            None => true,
        }
    }
}
