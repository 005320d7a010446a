//! Subprocess helpers shared by the probe, remote and subtitle modules.

use log::warn;
use std::io::{self, Read};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run a command to completion, capturing stdout and stderr.
///
/// Returns `Ok(None)` if the command did not finish within `timeout`; the
/// child is killed and reaped in that case.
///
/// # Errors
/// Returns an error if the process cannot be spawned or waited on.
pub fn output_with_timeout(cmd: &mut Command, timeout: Duration) -> io::Result<Option<Output>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain pipes on their own threads so a chatty child cannot block on a
    // full pipe while we poll for exit.
    let stdout_reader = spawn_drain(child.stdout.take());
    let stderr_reader = spawn_drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            kill_and_reap(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = join_reader(stdout_reader, "stdout").unwrap_or_default();
    let stderr = join_reader(stderr_reader, "stderr").unwrap_or_default();

    Ok(status.map(|status| Output {
        status,
        stdout,
        stderr,
    }))
}

fn spawn_drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Kill a child and wait for it so it does not linger as a zombie.
pub(crate) fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Join a pipe reader thread. A panic in the reader is logged and yields `None`.
pub(crate) fn join_reader<T>(handle: JoinHandle<T>, pipe: &str) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{} reader thread panicked; output may be incomplete", pipe);
            None
        }
    }
}

/// Lossy stdout as a trimmed string.
pub fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
