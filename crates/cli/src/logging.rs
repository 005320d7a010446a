//! Logger setup for the CLI
//!
//! Records go through `env_logger` to stdout and to a per-run file under the
//! log directory. `info` lines are written verbatim so the progress protocol
//! reaches any log-tailing front end unchanged.

use env_logger::{Builder, Target};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{Level, LevelFilter};
use std::env;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Run logs kept regardless of age.
pub const KEEP_LOGS: usize = 30;

/// Logs beyond [`KEEP_LOGS`] are only compressed once older than this.
pub const MIN_LOG_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const LOG_PREFIX: &str = "disc_archiver_";
const LOG_SUFFIX: &str = ".log";

/// Render one record the way it appears in the terminal and the log file.
pub fn render(level: Level, message: &str) -> String {
    match level {
        Level::Info => message.to_string(),
        Level::Warn => format!("Warning: {}", message),
        Level::Error => format!("ERROR: {}", message),
        Level::Debug => format!("[DEBUG] {}", message),
        Level::Trace => format!("[TRACE] {}", message),
    }
}

/// Per-run log file name, e.g. `disc_archiver_20240131_120000.log`.
pub fn log_file_name() -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{}{}{}", LOG_PREFIX, timestamp, LOG_SUFFIX)
}

fn is_run_log(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(LOG_PREFIX) && n.ends_with(LOG_SUFFIX))
        .unwrap_or(false)
}

/// Gzip `path` to `<path>.gz` and remove the original.
///
/// An existing archive is left alone and the plain log is still removed.
fn compress_log(path: &Path) -> io::Result<()> {
    let mut archive = path.as_os_str().to_owned();
    archive.push(".gz");
    let archive = PathBuf::from(archive);

    if !archive.exists() {
        let mut input = BufReader::new(File::open(path)?);
        let mut encoder = GzEncoder::new(File::create(&archive)?, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.sync_all()?;
    }
    fs::remove_file(path)
}

/// Compress old run logs in `dir`.
///
/// The newest [`KEEP_LOGS`] logs are kept as they are; older ones are
/// gzipped once they are at least `min_age` old. `current` is never touched.
/// Returns the number of logs archived.
pub fn rotate_logs(dir: &Path, keep: usize, min_age: Duration, current: Option<&Path>) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut logs: Vec<(PathBuf, SystemTime)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_run_log(p))
        .filter(|p| Some(p.as_path()) != current)
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((p, modified))
        })
        .collect();
    logs.sort_by(|a, b| b.1.cmp(&a.1));

    let now = SystemTime::now();
    let mut archived = 0;
    for (path, modified) in logs.into_iter().skip(keep) {
        let age = now.duration_since(modified).unwrap_or_default();
        if age < min_age {
            continue;
        }
        match compress_log(&path) {
            Ok(()) => archived += 1,
            Err(e) => log::warn!("Could not archive {}: {}", path.display(), e),
        }
    }
    archived
}

/// Writes everything to stdout and to the run log.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        // File write errors are ignored; stdout is authoritative.
        let _ = self.file.write_all(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

fn open_run_log(dir: &Path) -> io::Result<(PathBuf, File)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name());
    let file = File::options().create(true).append(true).open(&path)?;
    Ok((path, file))
}

/// Initialize the global logger.
///
/// Verbosity is `info` unless `RUST_LOG` says otherwise; `debug` forces
/// debug output. Returns the run log path, or `None` when the log file could
/// not be opened and output goes to stdout only.
pub fn init(log_dir: &Path, debug: bool) -> Option<PathBuf> {
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    if debug {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.format(|buf, record| {
        writeln!(buf, "{}", render(record.level(), &record.args().to_string()))
    });

    let log_path = match open_run_log(log_dir) {
        Ok((path, file)) => {
            builder.target(Target::Pipe(Box::new(TeeWriter { file })));
            Some(path)
        }
        Err(e) => {
            eprintln!(
                "Warning: could not open log file in {}: {}",
                log_dir.display(),
                e
            );
            builder.target(Target::Stdout);
            None
        }
    };
    builder.init();

    if let Some(path) = &log_path {
        let archived = rotate_logs(log_dir, KEEP_LOGS, MIN_LOG_AGE, Some(path));
        if archived > 0 {
            log::debug!("Compressed {} old log file(s)", archived);
        }
    }
    log_path
}
