//! Batch runner for Disc Archiver
//!
//! Drives a schedule of discs through rip, plan and encode submission, then
//! finalizes every title once all encodes of the whole batch have finished.

use crate::cancel::CancelFlag;
use crate::cleanup::{remove_mkvs_if_allowed, remove_work_dir_if_allowed, CleanupError};
use crate::coordinator::{CoordinatorError, EncodeCoordinator};
use crate::counters::CountersSnapshot;
use crate::disc::{movie_disc_outputs_exist, process_disc, DiscEnv, DiscError, DiscOutcome};
use crate::disk::{disk_targets, pause_if_low_disk_space, SpaceProbe};
use crate::operator::Operator;
use crate::probe::MetadataProber;
use crate::progress::{emit, ProgressEvent};
use crate::remote::{sync_movie_folder, sync_series_season, RemoteError, RemoteTransport};
use crate::rip::{
    check_main_feature, find_mkvs_in_dir, rip_disc_if_needed, DiscRipper, RipError, RipRequest,
    RipValidator,
};
use crate::schedule::{ScheduleError, ScheduleRow, ScheduleSource};
use crate::startup::StartupError;
use crate::title::{LibraryLayout, TitleContext, TitleOutputs};
use disc_archiver_config::{Config, SubtitleMode};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error type for batch runs
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Could not prepare work directory for {title}: {source}")]
    Title {
        title: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Rip(#[from] RipError),

    #[error(transparent)]
    Disc(#[from] DiscError),

    #[error(transparent)]
    Encode(#[from] CoordinatorError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("Operator input failed: {0}")]
    Operator(#[source] io::Error),

    #[error("Interrupted")]
    Interrupted,
}

impl BatchError {
    /// Process exit code: 127 for a missing tool, 130 for an interrupt,
    /// 2 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            BatchError::Startup(e) => e.exit_code(),
            BatchError::Interrupted
            | BatchError::Rip(RipError::Cancelled)
            | BatchError::Encode(CoordinatorError::Cancelled)
            | BatchError::Disc(DiscError::Encode(CoordinatorError::Cancelled)) => 130,
            _ => 2,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.exit_code() == 130
    }
}

/// Process-wide "something went wrong" flag.
///
/// Once set, nothing is cleaned up for the rest of the process.
#[derive(Debug, Clone, Default)]
pub struct FailSafe(Arc<AtomicBool>);

impl FailSafe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_failed(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn failed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Titles seen in this run, in first-seen order, one per batch key.
#[derive(Debug, Default)]
pub struct Batch {
    seen: HashSet<String>,
    titles: Vec<TitleContext>,
}

impl Batch {
    /// Record `ctx` unless a title with the same batch key is already in.
    pub fn add_once(&mut self, ctx: &TitleContext) -> bool {
        if !self.seen.insert(ctx.batch_key()) {
            return false;
        }
        self.titles.push(ctx.clone());
        true
    }

    pub fn titles(&self) -> &[TitleContext] {
        &self.titles
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

/// Run-level switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub preset: String,
    pub subtitle_mode: SubtitleMode,
    pub keep_mkvs: bool,
    /// Wait for the operator to confirm each insert prompt.
    pub disc_prompts: bool,
    pub min_free_gb: u64,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preset: config.encode.preset.clone(),
            subtitle_mode: config.encode.subtitle_mode,
            keep_mkvs: config.safety.keep_mkvs,
            disc_prompts: true,
            min_free_gb: config.safety.min_free_gb,
        }
    }
}

/// External collaborators of a run.
pub struct Collaborators<'a> {
    pub prober: &'a dyn MetadataProber,
    pub ripper: &'a dyn DiscRipper,
    pub operator: &'a dyn Operator,
    pub space: &'a dyn SpaceProbe,
    pub transport: &'a dyn RemoteTransport,
}

/// Drives one schedule to completion.
pub struct BatchRunner<'a> {
    layout: LibraryLayout,
    options: RunOptions,
    io: Collaborators<'a>,
    coordinator: &'a EncodeCoordinator,
    cancel: CancelFlag,
    failsafe: FailSafe,
}

impl<'a> BatchRunner<'a> {
    /// Create a runner.
    ///
    /// # Arguments
    /// * `layout` - Work root and library destinations
    /// * `options` - Preset, subtitle mode and safety switches
    /// * `io` - Prober, ripper, operator, disk space and remote transport
    /// * `coordinator` - Encode coordinator for this run
    /// * `cancel` - Interrupt flag, checked before every disc
    /// * `failsafe` - Set on any failure; forces artifacts to be kept
    pub fn new(
        layout: LibraryLayout,
        options: RunOptions,
        io: Collaborators<'a>,
        coordinator: &'a EncodeCoordinator,
        cancel: CancelFlag,
        failsafe: FailSafe,
    ) -> Self {
        Self {
            layout,
            options,
            io,
            coordinator,
            cancel,
            failsafe,
        }
    }

    /// Process every disc of `schedule`, then finalize.
    ///
    /// Any error marks the fail-safe, which skips finalization and leaves
    /// MKVs, manifests and partial encodes in place for a resumed run.
    pub fn run(&self, schedule: &mut dyn ScheduleSource) -> Result<CountersSnapshot, BatchError> {
        match self.run_schedule(schedule) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.failsafe.mark_failed();
                if e.is_interrupt() {
                    warn!("Interrupted. Files were left in place (safe mode).");
                } else {
                    emit(&ProgressEvent::Error(e.to_string()));
                    info!("Recovery tips:");
                    info!("  - Re-run with --keep-mkvs to prevent cleanup");
                    info!("  - If MKVs exist in the work directory, the same command resumes and transcodes");
                    warn!("Exiting after an error. Files were left in place (safe mode).");
                }
                Err(e)
            }
        }
    }

    fn run_schedule(&self, schedule: &mut dyn ScheduleSource) -> Result<CountersSnapshot, BatchError> {
        let mut batch = Batch::default();
        let mut failed_titles: HashSet<String> = HashSet::new();

        if schedule.is_batch() {
            info!("Continuous mode enabled: keep feeding discs; copy/cleanup runs after all encodes finish.");
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(BatchError::Interrupted);
            }
            let Some(row) = schedule.next_disc(self.io.operator)? else {
                break;
            };

            let ctx = TitleContext::setup(&row.spec, &self.layout).map_err(|source| {
                BatchError::Title {
                    title: row.spec.title_raw.clone(),
                    source,
                }
            })?;
            batch.add_once(&ctx);

            if failed_titles.contains(&ctx.batch_key()) {
                warn!(
                    "Skipping {} disc {}: an earlier disc of this title failed.",
                    ctx.display_name(),
                    row.disc
                );
            } else if let Err(e) = self.process_row(&ctx, &row, schedule.is_batch()) {
                let recoverable = matches!(e, BatchError::Rip(_))
                    && schedule.is_batch()
                    && !self.cancel.is_cancelled();
                if !recoverable {
                    return Err(e);
                }
                emit(&ProgressEvent::Error(format!(
                    "disc processing failed; continuing queue for {} disc {}: {}",
                    ctx.display_name(),
                    row.disc,
                    e
                )));
                failed_titles.insert(ctx.batch_key());
            }

            if let Some(next) = schedule.peek_next() {
                pause_if_low_disk_space(
                    self.io.space,
                    self.io.operator,
                    &disk_targets(&self.layout),
                    self.options.min_free_gb,
                )
                .map_err(BatchError::Operator)?;
                info!("Next up: {}", next.insert_prompt());
            }
        }

        self.coordinator.wait_all()?;
        self.finalize(&batch, &failed_titles)?;

        let summary = self.coordinator.counters().snapshot();
        match serde_json::to_string(&summary) {
            Ok(json) => debug!("Encode counters: {}", json),
            Err(e) => debug!("Encode counters unavailable: {}", e),
        }
        if !failed_titles.is_empty() {
            warn!(
                "{} title(s) had failed discs and were left in place.",
                failed_titles.len()
            );
        }
        emit(&ProgressEvent::Done);
        Ok(summary)
    }

    /// Rip (unless resumable) and process one schedule row.
    fn process_row(&self, ctx: &TitleContext, row: &ScheduleRow, batch_mode: bool) -> Result<(), BatchError> {
        let disc_dir = ctx.disc_dir(row.disc);

        if !ctx.is_series()
            && find_mkvs_in_dir(&disc_dir).is_empty()
            && movie_disc_outputs_exist(ctx, row.disc)
        {
            info!(
                "Resume: outputs already exist; skipping rip/encode: {} disc {}",
                ctx.display_name(),
                row.disc
            );
            return Ok(());
        }

        let prober = self.io.prober;
        let main_feature = |mkvs: &[PathBuf]| check_main_feature(prober, mkvs);
        let prompt = row.insert_prompt();
        let validate: Option<RipValidator<'_>> = if !ctx.is_series() && row.disc == 1 {
            Some(&main_feature)
        } else {
            None
        };
        let request = RipRequest {
            disc_dir: &disc_dir,
            prompt: &prompt,
            wait_for_enter: self.options.disc_prompts || !batch_mode,
            validate,
        };
        rip_disc_if_needed(self.io.ripper, self.io.operator, &self.cancel, &request)?;

        let env = DiscEnv {
            prober: self.io.prober,
            coordinator: self.coordinator,
            preset: &self.options.preset,
            subtitle_mode: self.options.subtitle_mode,
        };
        match process_disc(&env, ctx, row.disc, &disc_dir)? {
            DiscOutcome::AlreadyComplete => {}
            DiscOutcome::Submitted { planned, submitted } => debug!(
                "{} disc {}: {} planned, {} submitted",
                ctx.display_name(),
                row.disc,
                planned,
                submitted
            ),
        }
        Ok(())
    }

    /// Remote-sync and clean up every title of the batch.
    fn finalize(&self, batch: &Batch, failed_titles: &HashSet<String>) -> Result<(), BatchError> {
        for ctx in batch.titles() {
            if failed_titles.contains(&ctx.batch_key()) {
                warn!(
                    "Not finalizing {}: files were left in place.",
                    ctx.display_name()
                );
                continue;
            }
            emit(&ProgressEvent::Finalizing {
                title: ctx.display_name(),
            });

            if let Some(remote) = &ctx.remote {
                match &ctx.outputs {
                    TitleOutputs::Series { season_dir } => {
                        sync_series_season(self.io.transport, remote, &ctx.title, season_dir)?
                    }
                    TitleOutputs::Movie { movie_dir, .. } => sync_movie_folder(
                        self.io.transport,
                        remote,
                        &ctx.title,
                        &ctx.year,
                        movie_dir,
                    )?,
                }
            }

            let keep = self.options.keep_mkvs || self.failsafe.failed();
            remove_mkvs_if_allowed(&self.layout.work_root, &ctx.work_dir, &ctx.mkv_root, keep)?;
            remove_work_dir_if_allowed(&self.layout.work_root, &ctx.work_dir, keep)?;
        }
        Ok(())
    }
}
