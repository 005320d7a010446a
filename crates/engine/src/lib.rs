//! Disc Archiver
//!
//! Rips optical discs, classifies the ripped titles into main feature,
//! episodes and extras, plans stable library file names, and runs resumable
//! encodes with overlapped ripping.

pub mod batch;
pub mod cancel;
pub mod classify;
pub mod cleanup;
pub mod concurrency;
pub mod coordinator;
pub mod counters;
pub mod disc;
pub mod disk;
pub mod encode;
pub mod extras_nfo;
pub mod lock;
pub mod manifest;
pub mod naming;
pub mod operator;
pub mod planner;
pub mod probe;
pub mod process;
pub mod progress;
pub mod remote;
pub mod rip;
pub mod schedule;
pub mod startup;
pub mod title;

pub use disc_archiver_config as config;
pub use disc_archiver_config::Config;
pub use batch::{Batch, BatchError, BatchRunner, Collaborators, FailSafe, RunOptions};
pub use cancel::CancelFlag;
pub use classify::{classify, is_extra, ClassificationResult, EXTRA_DURATION_THRESHOLD};
pub use cleanup::{cleanup_mkvs, CleanupError};
pub use concurrency::EncodePlan;
pub use coordinator::{CoordinatorError, EncodeCoordinator, Submission};
pub use counters::{CountersSnapshot, EncodeCounters};
pub use disc::{process_disc, DiscEnv, DiscError, DiscOutcome};
pub use disk::{SpaceProbe, SystemSpace};
pub use encode::{EncodeError, EncodeJob, HandBrakeCli, Transcoder};
pub use lock::{EncodeLock, LockError};
pub use manifest::{load_manifest, write_manifest, DiscManifest, PlanItem, PlanItemKind};
pub use naming::{clean_title, sanitize_title};
pub use operator::{Operator, StdinOperator};
pub use planner::PlanError;
pub use probe::{FfprobeProber, MediaFacts, MediaFile, MetadataProber};
pub use progress::{emit, Phase, ProgressEvent};
pub use remote::{RemoteDest, RemoteError, RemoteTransport, SshTransport};
pub use rip::{DiscRipper, MakeMkv, RecoveryStage, RipError, RipRequest, RipSettings};
pub use schedule::{CsvSchedule, InteractiveSchedule, ScheduleError, ScheduleRow, ScheduleSource};
pub use startup::{check_deps, list_presets, run_startup_checks, StartupError};
pub use title::{LibraryLayout, MediaKind, MediaSpec, TitleContext, TitleSpec};
