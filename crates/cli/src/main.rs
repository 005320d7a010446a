//! CLI entry point for Disc Archiver
//!
//! Parses command line arguments, sets up logging and interrupt handling,
//! and runs one batch of discs.

mod logging;

use clap::Parser;
use disc_archiver::config::{ConfigError, DiscType, OutputContainer, SubtitleMode};
use disc_archiver::{
    check_deps, cleanup_mkvs, list_presets, run_startup_checks, BatchError, BatchRunner,
    CancelFlag, Collaborators, Config, CsvSchedule, EncodeCoordinator, EncodePlan,
    FailSafe, FfprobeProber, HandBrakeCli, InteractiveSchedule, LibraryLayout, MakeMkv,
    RipSettings, RunOptions, ScheduleSource, SshTransport, StdinOperator, SystemSpace,
};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Disc Archiver - rip, classify and encode discs into a media library
#[derive(Parser, Debug)]
#[command(name = "disc-archiver")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); missing means defaults
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// CSV schedule (name,year,series-or-y/n,disc); implies --continuous
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Keep asking for titles; implies --overlap
    #[arg(long)]
    continuous: bool,

    /// Rip the next disc while earlier encodes run
    #[arg(long)]
    overlap: bool,

    /// Maximum concurrent encodes in overlap mode
    #[arg(long)]
    encode_jobs: Option<u32>,

    /// Never delete MKVs or work directories
    #[arg(long)]
    keep_mkvs: bool,

    /// Do not wait for Enter before ripping each disc of a batch
    #[arg(long)]
    no_disc_prompts: bool,

    /// Movies library directory (local path or host:/path)
    #[arg(long)]
    movies_dir: Option<String>,

    /// Series library directory (local path or host:/path)
    #[arg(long)]
    series_dir: Option<String>,

    /// Directory holding per-title work directories
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Directory for run logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// HandBrake preset name
    #[arg(long)]
    preset: Option<String>,

    /// Output container (mp4 or mkv)
    #[arg(long)]
    output_container: Option<OutputContainer>,

    /// Subtitle handling (preset, soft, external, none)
    #[arg(long)]
    subtitle_mode: Option<SubtitleMode>,

    /// Disc type, sizes the MakeMKV cache (dvd or bluray)
    #[arg(long)]
    disc_type: Option<DiscType>,

    /// Print the status of every required tool and exit
    #[arg(long)]
    check_deps: bool,

    /// Print HandBrake's preset list and exit
    #[arg(long)]
    list_presets: bool,

    /// Delete MKV folders left in managed work directories and exit
    #[arg(long)]
    cleanup_mkvs: bool,

    /// With --cleanup-mkvs: list candidates without deleting
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn batch_mode(&self) -> bool {
        self.csv.is_some() || self.continuous
    }

    /// Fold command line overrides into the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.movies_dir {
            config.paths.movies_dir = dir.clone();
        }
        if let Some(dir) = &self.series_dir {
            config.paths.series_dir = dir.clone();
        }
        if let Some(dir) = &self.work_root {
            config.paths.work_root = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.paths.log_dir = Some(dir.clone());
        }
        if let Some(preset) = &self.preset {
            config.encode.preset = preset.clone();
        }
        if let Some(container) = self.output_container {
            config.encode.output_container = container;
        }
        if let Some(mode) = self.subtitle_mode {
            config.encode.subtitle_mode = mode;
        }
        if let Some(jobs) = self.encode_jobs {
            config.encode.encode_jobs = jobs;
        }
        if let Some(disc_type) = self.disc_type {
            config.rip.disc_type = disc_type;
        }
        if self.overlap || self.batch_mode() {
            config.encode.overlap = true;
        }
        if self.keep_mkvs {
            config.safety.keep_mkvs = true;
        }
    }
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load_or_default(Some(&args.config))?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// First Ctrl-C stops before the next disc or encode; the second exits now.
fn spawn_interrupt_handler(cancel: CancelFlag, failsafe: FailSafe) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received; stopping after the current step (Ctrl-C again to exit now).");
        cancel.cancel();
        failsafe.mark_failed();

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Interrupted. Files were left in place (safe mode).");
            std::process::exit(130);
        }
    });
}

fn report_log(log_path: Option<&Path>) {
    if let Some(path) = log_path {
        info!("Log: {}", path.display());
    }
}

/// Log an error raised before the batch runner takes over.
fn logged<E: Into<BatchError>>(e: E) -> BatchError {
    let e = e.into();
    error!("{}", e);
    e
}

/// Run the whole schedule. Blocks the calling thread.
fn run_batch(
    config: Config,
    args: Args,
    handle: Handle,
    cancel: CancelFlag,
    failsafe: FailSafe,
) -> Result<(), BatchError> {
    let layout = LibraryLayout::from_config(&config);
    let transport = SshTransport;
    run_startup_checks(&layout, &transport).map_err(logged)?;

    let mut schedule: Box<dyn ScheduleSource> = match &args.csv {
        Some(path) => {
            let csv = CsvSchedule::load(path).map_err(logged)?;
            info!("CSV schedule loaded: {} discs", csv.len());
            Box::new(csv)
        }
        None => Box::new(InteractiveSchedule::new(args.continuous)),
    };

    let plan = EncodePlan::derive(&config, schedule.is_batch());
    info!(
        "Encode plan: overlap={}, encode_jobs={}",
        plan.overlap, plan.encode_jobs
    );
    let coordinator =
        EncodeCoordinator::new(plan, Arc::new(HandBrakeCli), handle, cancel.clone());

    let mut options = RunOptions::from_config(&config);
    options.disc_prompts = !args.no_disc_prompts;

    let prober = FfprobeProber::default();
    let ripper = MakeMkv::new(RipSettings::from_config(&config));
    let io = Collaborators {
        prober: &prober,
        ripper: &ripper,
        operator: &StdinOperator,
        space: &SystemSpace,
        transport: &transport,
    };

    let runner = BatchRunner::new(layout, options, io, &coordinator, cancel, failsafe);
    let summary = runner.run(schedule.as_mut())?;
    info!(
        "Encodes: {} finished, {} failed",
        summary.finished, summary.failed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: Invalid configuration: {}", e);
            return exit(2);
        }
    };

    let log_path = logging::init(&config.paths.log_dir(), args.debug);
    debug!("Config file: {}", args.config.display());

    let layout = LibraryLayout::from_config(&config);
    if args.check_deps {
        return exit(check_deps(&layout));
    }
    if args.list_presets {
        return match list_presets() {
            Ok(code) => exit(code),
            Err(e) => {
                error!("{}", e);
                exit(e.exit_code())
            }
        };
    }
    if args.cleanup_mkvs {
        return exit(cleanup_mkvs(&layout, args.dry_run));
    }

    let cancel = CancelFlag::new();
    let failsafe = FailSafe::new();
    spawn_interrupt_handler(cancel.clone(), failsafe.clone());

    let handle = Handle::current();
    let task = tokio::task::spawn_blocking(move || {
        run_batch(config, args, handle, cancel, failsafe)
    });

    match task.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            report_log(log_path.as_deref());
            exit(e.exit_code())
        }
        Err(e) => {
            error!("Batch task failed: {}", e);
            report_log(log_path.as_deref());
            exit(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("disc-archiver").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_csv_implies_overlap() {
        let args = parse(&["--csv", "discs.csv"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert!(args.batch_mode());
        assert!(config.encode.overlap);
    }

    #[test]
    fn test_overrides_applied() {
        let args = parse(&[
            "--movies-dir",
            "nas:/srv/Movies",
            "--encode-jobs",
            "3",
            "--subtitle-mode",
            "soft",
            "--output-container",
            "mkv",
            "--keep-mkvs",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.paths.movies_dir, "nas:/srv/Movies");
        assert_eq!(config.encode.encode_jobs, 3);
        assert_eq!(config.encode.subtitle_mode, SubtitleMode::Soft);
        assert_eq!(config.encode.output_container, OutputContainer::Mkv);
        assert!(config.safety.keep_mkvs);
        assert!(!config.encode.overlap);
    }

    #[test]
    fn test_bad_subtitle_mode_rejected() {
        let argv = ["disc-archiver", "--subtitle-mode", "burned"];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_zero_jobs_fails_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("none.toml");
        let args = parse(&["--config", missing.to_str().unwrap(), "--encode-jobs", "0"]);
        assert!(matches!(load_config(&args), Err(ConfigError::Invalid(_))));
    }
}
