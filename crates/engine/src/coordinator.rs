//! Encode coordinator for Disc Archiver
//!
//! Accepts encode jobs from the batch runner and runs them either inline or
//! on a bounded pool, holding an [`EncodeLock`] on each output for the whole
//! life of the job.

use crate::cancel::CancelFlag;
use crate::concurrency::EncodePlan;
use crate::counters::EncodeCounters;
use crate::encode::{EncodeError, EncodeJob, Transcoder};
use crate::lock::{EncodeLock, LockError};
use crate::progress::{emit, ProgressEvent};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Error type for encode coordination
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Output is held by another encode
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The transcoder failed
    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    /// An encode task panicked or was aborted
    #[error("Encode task failed: {0}")]
    Join(String),

    /// The run was interrupted before the job was submitted
    #[error("Interrupted")]
    Cancelled,
}

/// What happened to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The output already existed.
    Skipped,
    /// Encoded inline before `submit` returned.
    Completed,
    /// Handed to the background pool.
    Queued,
}

/// Runs encode jobs for one batch run.
pub struct EncodeCoordinator {
    plan: EncodePlan,
    transcoder: Arc<dyn Transcoder>,
    handle: Handle,
    semaphore: Arc<Semaphore>,
    jobs: Mutex<JoinSet<Result<(), CoordinatorError>>>,
    counters: EncodeCounters,
    cancel: CancelFlag,
}

impl EncodeCoordinator {
    /// Create a coordinator.
    ///
    /// # Arguments
    /// * `plan` - Overlap mode and pool size
    /// * `transcoder` - Encoder used for every job
    /// * `handle` - Runtime the background pool runs on
    /// * `cancel` - Checked before every submission
    pub fn new(
        plan: EncodePlan,
        transcoder: Arc<dyn Transcoder>,
        handle: Handle,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(plan.permits())),
            plan,
            transcoder,
            handle,
            jobs: Mutex::new(JoinSet::new()),
            counters: EncodeCounters::new(),
            cancel,
        }
    }

    pub fn plan(&self) -> EncodePlan {
        self.plan
    }

    pub fn counters(&self) -> &EncodeCounters {
        &self.counters
    }

    /// Submit one job.
    ///
    /// An existing output is skipped. Otherwise the output's lock is taken
    /// before the job is queued, so a second run against the same output
    /// fails here instead of encoding twice. In inline mode the job runs on
    /// the calling thread and its error is returned directly; in overlap
    /// mode errors surface from [`EncodeCoordinator::wait_all`].
    pub fn submit(&self, job: EncodeJob) -> Result<Submission, CoordinatorError> {
        if self.cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }
        if job.output.exists() {
            info!("Skipping encode (exists): {}", job.output.display());
            return Ok(Submission::Skipped);
        }

        let lock = EncodeLock::acquire(&job.output)?;
        self.counters.record_queued();

        if !self.plan.overlap {
            run_job(self.transcoder.as_ref(), &self.counters, job, lock)?;
            return Ok(Submission::Completed);
        }

        emit(&ProgressEvent::EncodeQueued {
            name: job.output_name(),
        });
        let semaphore = Arc::clone(&self.semaphore);
        let transcoder = Arc::clone(&self.transcoder);
        let counters = self.counters.clone();
        let task = async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| CoordinatorError::Join(e.to_string()))?;
            tokio::task::spawn_blocking(move || {
                run_job(transcoder.as_ref(), &counters, job, lock)
            })
            .await
            .map_err(|e| CoordinatorError::Join(e.to_string()))?
        };

        let mut jobs = match self.jobs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        jobs.spawn_on(task, &self.handle);
        Ok(Submission::Queued)
    }

    /// Wait for every queued job.
    ///
    /// Every job is awaited even after a failure; the first error in
    /// completion order is returned. Must not be called from inside the
    /// runtime's async context.
    pub fn wait_all(&self) -> Result<(), CoordinatorError> {
        let mut jobs = {
            let mut guard = match self.jobs.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        if jobs.is_empty() {
            return Ok(());
        }

        let outstanding = jobs.len();
        info!("Waiting for {} queued encode(s) to finish...", outstanding);
        self.handle.block_on(async move {
            let mut first_err = None;
            while let Some(joined) = jobs.join_next().await {
                let result = joined
                    .map_err(|e| CoordinatorError::Join(e.to_string()))
                    .and_then(|r| r);
                if let Err(e) = result {
                    warn!("{}", e);
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

fn run_job(
    transcoder: &dyn Transcoder,
    counters: &EncodeCounters,
    job: EncodeJob,
    lock: EncodeLock,
) -> Result<(), CoordinatorError> {
    let name = job.output_name();
    let (started, queued) = counters.record_started();
    emit(&ProgressEvent::EncodeStarted {
        started,
        queued,
        name: name.clone(),
    });

    let result = transcoder.encode(&job, &mut |pid| {
        if let Err(e) = lock.record_pid(pid) {
            warn!("could not record encoder pid in {}: {}", lock.path().display(), e);
        }
    });
    drop(lock);

    match result {
        Ok(()) => {
            let (finished, queued) = counters.record_finished();
            emit(&ProgressEvent::EncodeDone {
                finished,
                queued,
                name,
            });
            Ok(())
        }
        Err(e) => {
            counters.record_failed();
            Err(CoordinatorError::Encode(e))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTranscoder;
    use super::*;
    use crate::lock::encode_lock_path;
    use disc_archiver_config::SubtitleMode;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::runtime::Runtime;

    fn job(dir: &Path, name: &str) -> EncodeJob {
        EncodeJob::new(
            dir.join("in.mkv"),
            dir.join(name),
            "Fast 1080p30",
            SubtitleMode::None,
        )
    }

    fn coordinator(
        rt: &Runtime,
        plan: EncodePlan,
        transcoder: Arc<FakeTranscoder>,
    ) -> EncodeCoordinator {
        EncodeCoordinator::new(plan, transcoder, rt.handle().clone(), CancelFlag::new())
    }

    fn overlap(jobs: u32) -> EncodePlan {
        EncodePlan {
            overlap: true,
            encode_jobs: jobs,
        }
    }

    #[test]
    fn test_inline_encode_and_skip_existing() {
        let rt = Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::default());
        let coord = coordinator(&rt, EncodePlan::inline(), Arc::clone(&fake));

        assert_eq!(coord.submit(job(dir.path(), "A.mp4")).unwrap(), Submission::Completed);
        assert!(!encode_lock_path(&dir.path().join("A.mp4")).exists());
        assert_eq!(coord.submit(job(dir.path(), "A.mp4")).unwrap(), Submission::Skipped);
        assert_eq!(fake.encoded_names(), vec!["A.mp4"]);

        let snap = coord.counters().snapshot();
        assert_eq!((snap.queued, snap.started, snap.finished), (1, 1, 1));
    }

    #[test]
    fn test_inline_failure_propagates() {
        let rt = Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::failing("Bad.mp4"));
        let coord = coordinator(&rt, EncodePlan::inline(), fake);

        let err = coord.submit(job(dir.path(), "Bad.mp4")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Encode(_)));
        assert!(!encode_lock_path(&dir.path().join("Bad.mp4")).exists());
        assert_eq!(coord.counters().snapshot().failed, 1);
    }

    #[test]
    fn test_overlap_respects_pool_size() {
        let rt = Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let coord = coordinator(&rt, overlap(2), Arc::clone(&fake));

        for i in 0..6 {
            let name = format!("E{:02}.mp4", i);
            assert_eq!(coord.submit(job(dir.path(), &name)).unwrap(), Submission::Queued);
        }
        coord.wait_all().unwrap();

        assert_eq!(fake.encoded_names().len(), 6);
        assert!(fake.max_running.load(Ordering::SeqCst) <= 2);
        let snap = coord.counters().snapshot();
        assert_eq!(snap.finished, 6);
        assert_eq!(snap.outstanding(), 0);
    }

    #[test]
    fn test_overlap_failure_surfaces_after_all_jobs() {
        let rt = Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeTranscoder::failing("B.mp4"));
        let coord = coordinator(&rt, overlap(1), Arc::clone(&fake));

        for name in ["A.mp4", "B.mp4", "C.mp4"] {
            coord.submit(job(dir.path(), name)).unwrap();
        }
        let err = coord.wait_all().unwrap_err();
        assert!(matches!(err, CoordinatorError::Encode(_)));

        let mut names = fake.encoded_names();
        names.sort();
        assert_eq!(names, vec!["A.mp4", "C.mp4"]);
        assert!(!encode_lock_path(&dir.path().join("B.mp4")).exists());
    }

    #[test]
    fn test_live_lock_rejects_submission() {
        let rt = Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&rt, overlap(1), Arc::new(FakeTranscoder::default()));

        let _held = EncodeLock::acquire(&dir.path().join("A.mp4")).unwrap();
        let err = coord.submit(job(dir.path(), "A.mp4")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Lock(LockError::Locked { .. })));
        assert_eq!(coord.counters().snapshot().queued, 0);
    }

    #[test]
    fn test_cancelled_rejects_submission() {
        let rt = Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let cancel = CancelFlag::new();
        let coord = EncodeCoordinator::new(
            overlap(1),
            Arc::new(FakeTranscoder::default()),
            rt.handle().clone(),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(matches!(
            coord.submit(job(dir.path(), "A.mp4")),
            Err(CoordinatorError::Cancelled)
        ));
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
