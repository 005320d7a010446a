//! Encode concurrency planning for Disc Archiver
//!
//! Derives how encodes are scheduled from configuration and run mode.

use disc_archiver_config::Config;

/// How encodes are scheduled for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePlan {
    /// Encodes run in the background while the next disc is ripped.
    pub overlap: bool,
    /// Maximum number of concurrent encodes (always at least 1).
    pub encode_jobs: u32,
}

impl EncodePlan {
    /// Derive the plan from configuration.
    ///
    /// Batch modes (CSV schedule, continuous) always overlap, since the
    /// operator is swapping discs while encodes run.
    pub fn derive(cfg: &Config, batch_mode: bool) -> Self {
        Self {
            overlap: cfg.encode.overlap || batch_mode,
            encode_jobs: cfg.encode.encode_jobs.max(1),
        }
    }

    /// Inline plan: every encode blocks the caller.
    pub fn inline() -> Self {
        Self {
            overlap: false,
            encode_jobs: 1,
        }
    }

    /// Number of encodes allowed to run at once.
    pub fn permits(&self) -> usize {
        if self.overlap {
            self.encode_jobs.max(1) as usize
        } else {
            1
        }
    }
}
