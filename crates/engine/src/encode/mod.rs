//! Encoding modules: HandBrake transcodes and subtitle sidecar extraction.

pub mod handbrake;
pub mod subtitles;

pub use handbrake::{
    build_handbrake_command, run_handbrake, subtitle_args, EncodeError, EncodeJob, HandBrakeCli,
    Transcoder,
};
pub use subtitles::{extract_external_subtitles, SubtitleSummary};
