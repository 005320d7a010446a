//! HandBrake encoder module
//!
//! Builds and runs `HandBrakeCLI` commands, streaming their carriage-return
//! progress output as throttled log lines.

use crate::process::{join_reader, kill_and_reap};
use crate::progress::{LineSplitter, ProgressThrottle};
use disc_archiver_config::SubtitleMode;
use log::{debug, info};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use thiserror::Error;

/// Number of trailing stderr lines kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// HandBrakeCLI exited with non-zero status
    #[error("HandBrakeCLI failed (exit {code}) for output: {output}{tail}")]
    HandBrakeFailed {
        code: i32,
        output: PathBuf,
        tail: String,
    },

    /// HandBrakeCLI was terminated by a signal
    #[error("HandBrakeCLI was terminated by signal for output: {0}")]
    Terminated(PathBuf),

    /// IO error while launching or reading the encoder
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One transcode request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub preset: String,
    pub subtitle_mode: SubtitleMode,
}

impl EncodeJob {
    pub fn new(input: PathBuf, output: PathBuf, preset: &str, subtitle_mode: SubtitleMode) -> Self {
        Self {
            input,
            output,
            preset: preset.to_string(),
            subtitle_mode,
        }
    }

    /// Output file name for log lines.
    pub fn output_name(&self) -> String {
        self.output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Something that can turn an input file into an encoded output.
///
/// `on_spawn` receives the PID of the encoder process as soon as it exists,
/// so the caller can record it in the output's lock.
pub trait Transcoder: Send + Sync {
    fn encode(&self, job: &EncodeJob, on_spawn: &mut dyn FnMut(u32)) -> Result<(), EncodeError>;
}

/// [`Transcoder`] backed by `HandBrakeCLI`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandBrakeCli;

impl Transcoder for HandBrakeCli {
    fn encode(&self, job: &EncodeJob, on_spawn: &mut dyn FnMut(u32)) -> Result<(), EncodeError> {
        run_handbrake(job, on_spawn)
    }
}

/// Subtitle flags for a subtitle mode.
///
/// External extraction happens before the encode, so the encode itself
/// drops subtitle tracks in that mode.
pub fn subtitle_args(mode: SubtitleMode) -> &'static [&'static str] {
    match mode {
        SubtitleMode::Soft => &["--all-subtitles", "--subtitle-default=none"],
        SubtitleMode::None | SubtitleMode::External => &["--subtitle=none"],
        SubtitleMode::Preset => &[],
    }
}

/// Build a HandBrakeCLI command for a job.
///
/// # Arguments
/// * `job` - Input, output, preset and subtitle mode
///
/// # Returns
/// A configured Command ready for execution
pub fn build_handbrake_command(job: &EncodeJob) -> Command {
    let mut cmd = Command::new("HandBrakeCLI");
    cmd.arg("-i").arg(&job.input);
    cmd.arg("-o").arg(&job.output);
    cmd.arg("--preset").arg(&job.preset);
    cmd.args(subtitle_args(job.subtitle_mode));
    cmd
}

/// Execute a HandBrake encode.
///
/// # Errors
/// Returns an error if:
/// - HandBrakeCLI fails to start (IO error)
/// - HandBrakeCLI exits with non-zero status
/// - HandBrakeCLI is terminated by a signal
pub fn run_handbrake(job: &EncodeJob, on_spawn: &mut dyn FnMut(u32)) -> Result<(), EncodeError> {
    run_encoder_command(build_handbrake_command(job), &job.output, on_spawn)
}

/// Run an encoder command, echoing throttled stdout and keeping a stderr tail.
pub(crate) fn run_encoder_command(
    cmd: Command,
    output: &Path,
    on_spawn: &mut dyn FnMut(u32),
) -> Result<(), EncodeError> {
    run_encoder_with(cmd, output, on_spawn, |stdout| {
        stream_progress(stdout, &mut ProgressThrottle::default(), |line| {
            info!("{}", line)
        })
    })
}

/// Like [`run_encoder_command`], with the stdout consumer supplied.
///
/// If `read_stdout` fails the child is killed and reaped before the error
/// is returned.
fn run_encoder_with(
    mut cmd: Command,
    output: &Path,
    on_spawn: &mut dyn FnMut(u32),
    read_stdout: impl FnOnce(ChildStdout) -> io::Result<()>,
) -> Result<(), EncodeError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    on_spawn(child.id());

    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_reader = child.stderr.take().map(|stderr| {
        let tail = Arc::clone(&tail);
        thread::spawn(move || collect_stderr(stderr, &tail))
    });

    if let Some(stdout) = child.stdout.take() {
        if let Err(e) = read_stdout(stdout) {
            kill_and_reap(&mut child);
            if let Some(handle) = stderr_reader {
                join_reader(handle, "stderr");
            }
            return Err(e.into());
        }
    }

    let status = child.wait()?;
    if let Some(handle) = stderr_reader {
        join_reader(handle, "stderr");
    }

    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => {
            let lines: Vec<String> = tail
                .lock()
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default();
            let tail = if lines.is_empty() {
                String::new()
            } else {
                format!("\n{}", lines.join("\n"))
            };
            Err(EncodeError::HandBrakeFailed {
                code,
                output: output.to_path_buf(),
                tail,
            })
        }
        None => Err(EncodeError::Terminated(output.to_path_buf())),
    }
}

/// Read an encoder's stdout, passing lines the throttle lets through to `emit`.
pub(crate) fn stream_progress<R: Read>(
    mut reader: R,
    throttle: &mut ProgressThrottle,
    mut emit: impl FnMut(&str),
) -> io::Result<()> {
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
            if throttle.should_emit_line(&line, Instant::now()) {
                emit(&line);
            }
        }
    }
    if let Some(line) = splitter.finish() {
        if throttle.should_emit_line(&line, Instant::now()) {
            emit(&line);
        }
    }
    Ok(())
}

fn collect_stderr<R: Read>(mut reader: R, tail: &Mutex<VecDeque<String>>) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];
    let keep = |line: String| {
        debug!("HandBrake: {}", line);
        if let Ok(mut t) = tail.lock() {
            if t.len() == STDERR_TAIL_LINES {
                t.pop_front();
            }
            t.push_back(line);
        }
    };
    while let Ok(n) = reader.read(&mut buf) {
        if n == 0 {
            break;
        }
        splitter.push(&buf[..n]).into_iter().for_each(&keep);
    }
    if let Some(line) = splitter.finish() {
        keep(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn subtitle_mode_strategy() -> impl Strategy<Value = SubtitleMode> {
        prop_oneof![
            Just(SubtitleMode::Preset),
            Just(SubtitleMode::Soft),
            Just(SubtitleMode::External),
            Just(SubtitleMode::None),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_handbrake_command_completeness(
            input in "[a-zA-Z0-9_/.-]{1,40}",
            output in "[a-zA-Z0-9_/.-]{1,40}",
            preset in "[a-zA-Z0-9 ]{1,20}",
            mode in subtitle_mode_strategy(),
        ) {
            let job = EncodeJob::new(input.clone().into(), output.clone().into(), &preset, mode);
            let cmd = build_handbrake_command(&job);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.get_program(), "HandBrakeCLI");
            prop_assert!(has_flag_with_value(&args, "-i", &input));
            prop_assert!(has_flag_with_value(&args, "-o", &output));
            prop_assert!(has_flag_with_value(&args, "--preset", &preset));
            for flag in subtitle_args(mode) {
                prop_assert!(args.iter().any(|a| a == flag));
            }
        }
    }

    #[test]
    fn test_subtitle_args() {
        assert_eq!(
            subtitle_args(SubtitleMode::Soft),
            &["--all-subtitles", "--subtitle-default=none"]
        );
        assert_eq!(subtitle_args(SubtitleMode::External), &["--subtitle=none"]);
        assert_eq!(subtitle_args(SubtitleMode::None), &["--subtitle=none"]);
        assert!(subtitle_args(SubtitleMode::Preset).is_empty());
    }

    #[test]
    fn test_stream_progress_throttles() {
        let input = b"Encoding: task 1 of 1, 1.00 %\rEncoding: task 1 of 1, 1.50 %\rEncoding: task 1 of 1, 2.00 %\r\nEncode done!\n";
        let mut emitted = Vec::new();
        stream_progress(&input[..], &mut ProgressThrottle::default(), |l| {
            emitted.push(l.to_string())
        })
        .unwrap();
        assert_eq!(
            emitted,
            vec![
                "Encoding: task 1 of 1, 1.00 %",
                "Encoding: task 1 of 1, 2.00 %",
                "Encode done!"
            ]
        );
    }

    #[test]
    fn test_run_encoder_success_reports_pid() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'Encoding: 50.00 %%\\r'; exit 0");
        let mut pid = None;
        run_encoder_command(cmd, Path::new("/tmp/out.mp4"), &mut |p| pid = Some(p)).unwrap();
        assert!(pid.is_some());
    }

    #[test]
    fn test_run_encoder_failure_carries_tail() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'no title found' >&2; exit 3");
        let err = run_encoder_command(cmd, Path::new("/tmp/out.mp4"), &mut |_| {}).unwrap_err();
        match err {
            EncodeError::HandBrakeFailed { code, tail, .. } => {
                assert_eq!(code, 3);
                assert!(tail.contains("no title found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stdout_error_kills_encoder() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        use std::time::Duration;

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut pid = 0;
        let started = Instant::now();
        let err = run_encoder_with(cmd, Path::new("/tmp/out.mp4"), &mut |p| pid = p, |_| {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
        })
        .unwrap_err();

        assert!(matches!(err, EncodeError::Io(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        // Reaped: the pid no longer names a process or zombie.
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[test]
    fn test_missing_binary_is_io_error() {
        let cmd = Command::new("definitely-not-handbrake-xyz");
        let err = run_encoder_command(cmd, Path::new("/tmp/out.mp4"), &mut |_| {}).unwrap_err();
        assert!(matches!(err, EncodeError::Io(_)));
    }
}
