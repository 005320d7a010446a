//! Disc ripping via MakeMKV
//!
//! The optical drive is a singleton, so rips are strictly serial. A disc
//! directory that already holds acceptable MKVs is never ripped again.
//!
//! A failed or rejected rip falls back to recovery tools, in order:
//! `ddrescue` (disc image), `dvdbackup` and `vobcopy` (VIDEO_TS copies).
//! Each recovered source is fed back to MakeMKV as a `file:` source.

use crate::cancel::CancelFlag;
use crate::cleanup::human_bytes;
use crate::operator::Operator;
use crate::probe::MetadataProber;
use crate::process::{join_reader, kill_and_reap, output_with_timeout};
use crate::progress::{
    emit, is_makemkv_progress_record, parse_makemkv_prgv, LineSplitter, Phase, ProgressEvent,
    ProgressThrottle,
};
use disc_archiver_config::Config;
use log::{info, warn};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

/// makemkvcon exit code for "failed to open disc" (tray not ready, drive hiccup).
pub const DISC_NOT_READY_EXIT: i32 = 11;

/// Pause before the automatic retry after [`DISC_NOT_READY_EXIT`].
pub const NOT_READY_BACKOFF: Duration = Duration::from_secs(8);

/// A movie disc 1 whose longest title is shorter than this probably holds
/// only extras.
pub const MIN_MAIN_FEATURE_SECONDS: u64 = 2400;

/// Recovery output lives here, inside the disc directory.
pub const FALLBACK_DIR_NAME: &str = "_fallback";

const EJECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How often a long ddrescue pass reports that it is still alive.
const DDRESCUE_HEARTBEAT: Duration = Duration::from_secs(10);

const CHILD_POLL: Duration = Duration::from_millis(250);

/// Error type for rip operations
#[derive(Debug, Error)]
pub enum RipError {
    /// makemkvcon exited with non-zero status
    #[error("MakeMKV failed with exit code {0}")]
    MakeMkvFailed(i32),

    /// makemkvcon was terminated by a signal
    #[error("MakeMKV was terminated by signal")]
    Terminated,

    /// Direct rip and every recovery stage failed
    #[error(
        "Fallback: all recovery stages failed (direct MakeMKV, ddrescue, dvdbackup, vobcopy). Last reason: {0}"
    )]
    RecoveryFailed(String),

    /// The run was interrupted while waiting to rip
    #[error("Interrupted")]
    Cancelled,

    /// IO error while launching MakeMKV or waiting for the operator
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Settings for one MakeMKV invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipSettings {
    pub cache_mb: u32,
    pub min_title_seconds: u32,
    pub source: String,
    pub device: String,
}

impl RipSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_mb: config.rip.disc_type.makemkv_cache_mb(),
            min_title_seconds: config.rip.min_title_seconds,
            source: "disc:0".to_string(),
            device: config.rip.disc_device.clone(),
        }
    }

    /// Same settings, reading from a recovered image or folder.
    pub fn with_file_source(&self, source: &Path) -> Self {
        Self {
            source: format!("file:{}", source.display()),
            ..self.clone()
        }
    }
}

/// Recovery tools tried after the direct rip, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStage {
    Ddrescue,
    Dvdbackup,
    Vobcopy,
}

impl RecoveryStage {
    pub const ALL: [RecoveryStage; 3] = [
        RecoveryStage::Ddrescue,
        RecoveryStage::Dvdbackup,
        RecoveryStage::Vobcopy,
    ];

    /// Binary that implements the stage.
    pub fn tool(&self) -> &'static str {
        match self {
            RecoveryStage::Ddrescue => "ddrescue",
            RecoveryStage::Dvdbackup => "dvdbackup",
            RecoveryStage::Vobcopy => "vobcopy",
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            RecoveryStage::Ddrescue => "ddrescue image recovery + MakeMKV from recovered image",
            RecoveryStage::Dvdbackup => "dvdbackup structure copy + MakeMKV from VIDEO_TS",
            RecoveryStage::Vobcopy => "vobcopy extraction + MakeMKV from fallback output",
        }
    }
}

/// Something that can rip the inserted disc into a directory.
pub trait DiscRipper: Send + Sync {
    fn rip(&self, out_dir: &Path) -> Result<(), RipError>;

    /// Rip from a recovered image or VIDEO_TS folder instead of the drive.
    fn rip_from(&self, source: &Path, out_dir: &Path) -> Result<(), RipError>;

    /// Run one recovery stage into `disc_dir`, returning a source MakeMKV
    /// can read. `None` when the tool is missing or produced nothing.
    fn recover(&self, stage: RecoveryStage, disc_dir: &Path) -> Option<PathBuf>;

    /// Open the tray. Best effort.
    fn eject(&self);

    /// Close the tray before a retry. Best effort.
    fn close_tray(&self);

    fn retry_backoff(&self) -> Duration {
        NOT_READY_BACKOFF
    }
}

/// [`DiscRipper`] backed by `makemkvcon`.
#[derive(Debug, Clone)]
pub struct MakeMkv {
    settings: RipSettings,
}

impl MakeMkv {
    pub fn new(settings: RipSettings) -> Self {
        Self { settings }
    }

    fn run_eject(&self, extra: &[&str]) {
        let mut cmd = Command::new("eject");
        cmd.args(extra).arg(&self.settings.device);
        match output_with_timeout(&mut cmd, EJECT_TIMEOUT) {
            Ok(Some(out)) if !out.status.success() => {
                warn!("eject {} exited with {}", self.settings.device, out.status)
            }
            Ok(None) => warn!("eject {} timed out", self.settings.device),
            Err(e) => warn!("eject {} failed: {}", self.settings.device, e),
            Ok(Some(_)) => {}
        }
    }
}

impl DiscRipper for MakeMkv {
    fn rip(&self, out_dir: &Path) -> Result<(), RipError> {
        run_makemkv(&self.settings, out_dir)
    }

    fn rip_from(&self, source: &Path, out_dir: &Path) -> Result<(), RipError> {
        run_makemkv(&self.settings.with_file_source(source), out_dir)
    }

    fn recover(&self, stage: RecoveryStage, disc_dir: &Path) -> Option<PathBuf> {
        if which::which(stage.tool()).is_err() {
            info!(
                "Fallback: {} not available; skipping {} stage.",
                stage.tool(),
                stage.tool()
            );
            return None;
        }
        let device = &self.settings.device;
        let result = match stage {
            RecoveryStage::Ddrescue => ddrescue_image(device, disc_dir),
            RecoveryStage::Dvdbackup => dvdbackup_copy(device, disc_dir),
            RecoveryStage::Vobcopy => vobcopy_copy(device, disc_dir),
        };
        result.unwrap_or_else(|e| {
            warn!("Fallback: {} failed: {}", stage.tool(), e);
            None
        })
    }

    fn eject(&self) {
        self.run_eject(&[]);
    }

    fn close_tray(&self) {
        self.run_eject(&["-t"]);
    }
}

/// Build the makemkvcon command for a rip into `out_dir`.
///
/// The cache size is clamped to 16..=8192 MB.
pub fn build_makemkv_command(settings: &RipSettings, out_dir: &Path) -> Command {
    let mut cmd = Command::new("makemkvcon");
    cmd.args(["mkv", "--progress=-stdout", "--decrypt"])
        .arg(format!("--cache={}", settings.cache_mb.clamp(16, 8192)))
        .arg(format!("--minlength={}", settings.min_title_seconds))
        .arg(&settings.source)
        .arg("all")
        .arg(out_dir);
    cmd
}

/// Run MakeMKV, translating its robot-mode progress into protocol lines.
pub fn run_makemkv(settings: &RipSettings, out_dir: &Path) -> Result<(), RipError> {
    fs::create_dir_all(out_dir)?;
    let mut child = build_makemkv_command(settings, out_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr_reader = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            let _ = forward_lines(stderr, |line| info!("{}", line));
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut throttle = ProgressThrottle::default();
        let streamed = forward_lines(stdout, |line| {
            if let Some(out) = translate_makemkv_line(line, &mut throttle, Instant::now()) {
                info!("{}", out);
            }
        });
        if let Err(e) = streamed {
            kill_and_reap(&mut child);
            return Err(e.into());
        }
    }

    let status = child.wait()?;
    if let Some(handle) = stderr_reader {
        join_reader(handle, "MakeMKV stderr");
    }
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(RipError::MakeMkvFailed(code)),
        None => Err(RipError::Terminated),
    }
}

/// Map one MakeMKV output line to what the console should show.
///
/// `PRGV` records become throttled `MakeMKV progress` lines, other progress
/// records are dropped, everything else passes through.
pub fn translate_makemkv_line(
    line: &str,
    throttle: &mut ProgressThrottle,
    now: Instant,
) -> Option<String> {
    if let Some(percent) = parse_makemkv_prgv(line) {
        return throttle.should_emit_percent(percent, now).then(|| {
            ProgressEvent::Progress {
                phase: Phase::Rip,
                percent,
            }
            .to_string()
        });
    }
    if is_makemkv_progress_record(line) {
        return None;
    }
    Some(line.to_string())
}

fn forward_lines<R: Read>(mut reader: R, mut f: impl FnMut(&str)) -> io::Result<()> {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for line in splitter.push(&buf[..n]) {
            f(&line);
        }
    }
    if let Some(line) = splitter.finish() {
        f(&line);
    }
    Ok(())
}

/// Wait for `child`, calling `on_tick` with the elapsed time every `interval`.
fn wait_with_heartbeat(
    child: &mut Child,
    interval: Duration,
    mut on_tick: impl FnMut(Duration),
) -> io::Result<ExitStatus> {
    let started = Instant::now();
    let mut last_tick = started;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if last_tick.elapsed() >= interval {
            last_tick = Instant::now();
            on_tick(started.elapsed());
        }
        thread::sleep(CHILD_POLL);
    }
}

/// Two ddrescue passes (fast, then retrying bad sectors) into an ISO image.
fn ddrescue_image(device: &str, disc_dir: &Path) -> io::Result<Option<PathBuf>> {
    let dir = disc_dir.join(FALLBACK_DIR_NAME);
    fs::create_dir_all(&dir)?;
    let iso = dir.join("recovered_disc.iso");
    let map = dir.join("recovered_disc.map");

    let passes: [(&str, &str, &[&str]); 2] = [
        ("pass 1/2", "no retries", &["-f", "-n"]),
        ("pass 2/2", "retry bad sectors", &["-f", "-d", "-r3"]),
    ];
    for (label, note, flags) in passes {
        info!("Fallback: running ddrescue image recovery ({}, {}).", label, note);
        let mut child = Command::new("ddrescue")
            .args(flags)
            .arg(device)
            .arg(&iso)
            .arg(&map)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;
        let status = wait_with_heartbeat(&mut child, DDRESCUE_HEARTBEAT, |elapsed| {
            let secs = elapsed.as_secs();
            let size = fs::metadata(&iso)
                .map(|m| human_bytes(m.len()))
                .unwrap_or_else(|_| "unknown".to_string());
            info!(
                "Fallback: ddrescue {} still running (elapsed {:02}:{:02}, recovered size {}).",
                label,
                secs / 60,
                secs % 60,
                size
            );
        })?;
        if !status.success() {
            warn!("Fallback: ddrescue {} exited with {}.", label, status);
        }
    }

    let size = fs::metadata(&iso).map(|m| m.len()).unwrap_or(0);
    if size > 0 {
        info!("Fallback: ddrescue produced image: {}", iso.display());
        Ok(Some(iso))
    } else {
        info!("Fallback: ddrescue did not produce a usable image.");
        Ok(None)
    }
}

/// Run a copy tool, echoing its combined output to the log.
fn run_copy_tool(cmd: &mut Command) -> io::Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd.stdin(Stdio::null()).output()?;
    for stream in [&output.stdout, &output.stderr] {
        for line in String::from_utf8_lossy(stream).lines() {
            info!("{}", line);
        }
    }
    if !output.status.success() {
        warn!("Fallback: {} exited with {}.", program, output.status);
    }
    Ok(())
}

/// First `VIDEO_TS` directory below `dir`, by path order.
pub fn find_video_ts(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_dir() && e.file_name() == "VIDEO_TS")
        .map(|e| e.into_path())
}

/// Whether any `.vob` file exists below `dir`.
pub fn has_vob_files(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("vob"))
                .unwrap_or(false)
        })
}

fn dvdbackup_copy(device: &str, disc_dir: &Path) -> io::Result<Option<PathBuf>> {
    let out = disc_dir.join(FALLBACK_DIR_NAME).join("dvdbackup");
    fs::create_dir_all(&out)?;
    info!("Fallback: running dvdbackup full-disc copy.");
    run_copy_tool(Command::new("dvdbackup").args(["-i", device, "-M", "-o"]).arg(&out))?;

    let found = find_video_ts(&out);
    match &found {
        Some(video_ts) => info!("Fallback: dvdbackup produced VIDEO_TS: {}", video_ts.display()),
        None => info!("Fallback: dvdbackup did not produce a usable VIDEO_TS folder."),
    }
    Ok(found)
}

fn vobcopy_copy(device: &str, disc_dir: &Path) -> io::Result<Option<PathBuf>> {
    let out = disc_dir.join(FALLBACK_DIR_NAME).join("vobcopy");
    fs::create_dir_all(&out)?;
    info!("Fallback: running vobcopy extraction.");
    run_copy_tool(Command::new("vobcopy").args(["-i", device, "-m", "-o"]).arg(&out))?;

    if let Some(video_ts) = find_video_ts(&out) {
        info!("Fallback: vobcopy produced VIDEO_TS: {}", video_ts.display());
        return Ok(Some(video_ts));
    }
    if has_vob_files(&out) {
        info!("Fallback: vobcopy produced VOB files in: {}", out.display());
        return Ok(Some(out));
    }
    info!("Fallback: vobcopy did not produce usable VOB/VIDEO_TS output.");
    Ok(None)
}

/// All `.mkv` files under `dir`, recursively, sorted by path.
pub fn find_mkvs_in_dir(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut mkvs: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case("mkv"))
                .unwrap_or(false)
        })
        .collect();
    mkvs.sort();
    mkvs
}

/// Rejects a rip that is not worth encoding, with the reason.
pub type RipValidator<'a> = &'a dyn Fn(&[PathBuf]) -> Result<(), String>;

/// One disc to rip.
pub struct RipRequest<'a> {
    pub disc_dir: &'a Path,
    /// Insert prompt shown before ripping.
    pub prompt: &'a str,
    /// Block on the operator after the prompt.
    pub wait_for_enter: bool,
    /// Applied to fresh rips and to MKVs found on resume.
    pub validate: Option<RipValidator<'a>>,
}

fn acceptable_rip(disc_dir: &Path, validate: Option<RipValidator<'_>>) -> Result<Vec<PathBuf>, String> {
    let mkvs = find_mkvs_in_dir(disc_dir);
    if mkvs.is_empty() {
        return Err("No MKVs found after rip attempt.".to_string());
    }
    if let Some(validate) = validate {
        validate(&mkvs)?;
    }
    Ok(mkvs)
}

/// Direct rip with the "disc not ready" retry policy.
fn rip_with_retry(
    ripper: &dyn DiscRipper,
    operator: &dyn Operator,
    cancel: &CancelFlag,
    disc_dir: &Path,
) -> Result<(), RipError> {
    let mut auto_retry_used = false;
    loop {
        if cancel.is_cancelled() {
            return Err(RipError::Cancelled);
        }
        match ripper.rip(disc_dir) {
            Ok(()) => return Ok(()),
            Err(RipError::MakeMkvFailed(DISC_NOT_READY_EXIT)) if !auto_retry_used => {
                auto_retry_used = true;
                let backoff = ripper.retry_backoff();
                info!(
                    "MakeMKV could not open the disc (exit {}). Retrying once in {} seconds...",
                    DISC_NOT_READY_EXIT,
                    backoff.as_secs()
                );
                ripper.close_tray();
                thread::sleep(backoff);
            }
            Err(RipError::MakeMkvFailed(DISC_NOT_READY_EXIT)) => {
                operator.confirm(
                    "MakeMKV could not open the disc (exit 11). Check the disc/drive and press Enter to retry (or Ctrl-C to abort).",
                )?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Walk the recovery stages until the disc directory holds an acceptable rip.
fn recover_disc(
    ripper: &dyn DiscRipper,
    cancel: &CancelFlag,
    req: &RipRequest<'_>,
    failure: String,
) -> Result<Vec<PathBuf>, RipError> {
    warn!("Fallback: direct MakeMKV rip failed: {}", failure);
    let total = RecoveryStage::ALL.len();
    let mut reason = failure;

    for (i, stage) in RecoveryStage::ALL.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(RipError::Cancelled);
        }
        info!("Fallback: stage {}/{}: {}.", i + 1, total, stage.describe());
        if let Some(source) = ripper.recover(stage, req.disc_dir) {
            match ripper.rip_from(&source, req.disc_dir) {
                Ok(()) => info!("Fallback: MakeMKV from {} output finished.", stage.tool()),
                Err(e) => warn!("Fallback: MakeMKV from {} output failed: {}", stage.tool(), e),
            }
        }
        match acceptable_rip(req.disc_dir, req.validate) {
            Ok(mkvs) => {
                info!("Fallback: recovered disc via {}.", stage.tool());
                return Ok(mkvs);
            }
            Err(r) => {
                warn!(
                    "Fallback: stage {}/{} output still not acceptable: {}",
                    i + 1,
                    total,
                    r
                );
                reason = r;
            }
        }
    }
    Err(RipError::RecoveryFailed(reason))
}

/// Rip a disc into `req.disc_dir` unless it already holds an acceptable rip.
///
/// The prompt is shown first; with `wait_for_enter` the operator must confirm
/// it. A "disc not ready" failure is retried once automatically after closing
/// the tray, then on operator confirmation for as long as it persists. Any
/// other MakeMKV failure, an empty rip, or a rip (fresh or resumed) rejected
/// by `req.validate` enters the recovery stages. The tray is ejected after a
/// successful rip.
///
/// # Errors
/// [`RipError::RecoveryFailed`] when no stage produced an acceptable rip,
/// [`RipError::Cancelled`] on interrupt, IO errors from the operator or from
/// launching MakeMKV.
pub fn rip_disc_if_needed(
    ripper: &dyn DiscRipper,
    operator: &dyn Operator,
    cancel: &CancelFlag,
    req: &RipRequest<'_>,
) -> Result<Vec<PathBuf>, RipError> {
    let existing = find_mkvs_in_dir(req.disc_dir);
    let failure = if !existing.is_empty() {
        info!(
            "Resume: found existing MKVs in {}; validating rip before encode.",
            req.disc_dir.display()
        );
        match acceptable_rip(req.disc_dir, req.validate) {
            Ok(mkvs) => return Ok(mkvs),
            Err(reason) => {
                warn!(
                    "Resume: existing rip failed validation; entering fallback flow: {}",
                    reason
                );
                reason
            }
        }
    } else {
        if req.wait_for_enter {
            operator.confirm(req.prompt)?;
        } else {
            emit(&ProgressEvent::Prompt(req.prompt.to_string()));
        }
        match rip_with_retry(ripper, operator, cancel, req.disc_dir) {
            Ok(()) => match acceptable_rip(req.disc_dir, req.validate) {
                Ok(mkvs) => {
                    ripper.eject();
                    return Ok(mkvs);
                }
                Err(reason) => reason,
            },
            Err(e @ (RipError::MakeMkvFailed(_) | RipError::Terminated)) => e.to_string(),
            Err(e) => return Err(e),
        }
    };

    let mkvs = recover_disc(ripper, cancel, req, failure)?;
    ripper.eject();
    Ok(mkvs)
}

/// Check that a movie disc 1 rip holds something feature-length.
///
/// Fails when the longest readable title is under
/// [`MIN_MAIN_FEATURE_SECONDS`]. Unreadable durations pass.
pub fn check_main_feature(prober: &dyn MetadataProber, mkvs: &[PathBuf]) -> Result<(), String> {
    let Some(longest) = mkvs
        .iter()
        .map(|f| prober.duration_seconds(f))
        .filter(|d| *d > 0)
        .max()
    else {
        return Ok(());
    };
    if longest < MIN_MAIN_FEATURE_SECONDS {
        return Err(format!(
            "Longest ripped title is only {} min; likely extras-only rip.",
            longest / 60
        ));
    }
    Ok(())
}
