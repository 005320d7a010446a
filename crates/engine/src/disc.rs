//! Per-disc resume and execution.
//!
//! A ripped disc is planned once: the plan is persisted as a manifest before
//! any encode is submitted, and every later run executes that same plan,
//! submitting only the outputs that are still missing.

use crate::coordinator::{CoordinatorError, EncodeCoordinator, Submission};
use crate::encode::{extract_external_subtitles, EncodeJob};
use crate::extras_nfo::{append_extra_if_missing, close_extras_nfo};
use crate::lock::output_is_locked;
use crate::manifest::{load_manifest, write_manifest, DiscManifest, PlanItem, PlanItemKind};
use crate::planner::{plan_movie_disc, plan_series_disc, PlanError};
use crate::probe::{probe_file, MetadataProber};
use crate::rip::find_mkvs_in_dir;
use crate::title::{disc_dir_name, TitleContext};
use disc_archiver_config::SubtitleMode;
use log::info;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for disc processing
#[derive(Debug, Error)]
pub enum DiscError {
    #[error("No MKVs found in {}", .0.display())]
    NoMkvs(PathBuf),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Failed to write disc manifest in {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Encode(#[from] CoordinatorError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What processing a disc amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscOutcome {
    /// Every planned output already exists.
    AlreadyComplete,
    /// Missing outputs were handed to the coordinator.
    Submitted { planned: usize, submitted: usize },
}

/// Collaborators shared by every disc of a run.
pub struct DiscEnv<'a> {
    pub prober: &'a dyn MetadataProber,
    pub coordinator: &'a EncodeCoordinator,
    pub preset: &'a str,
    pub subtitle_mode: SubtitleMode,
}

/// Whether a movie disc's outputs already exist with no encode in flight.
///
/// Disc 1 looks for the main file; later discs for any `Disc<NN>_*` extra.
/// Used to skip re-ripping a disc whose MKVs were cleaned up already.
pub fn movie_disc_outputs_exist(ctx: &TitleContext, disc: u32) -> bool {
    if ctx.is_series() || disc < 1 {
        return false;
    }
    if disc == 1 {
        return ctx
            .main_file()
            .map_or(false, |main| main.exists() && !output_is_locked(main));
    }

    let prefix = format!("{}_", disc_dir_name(disc));
    let suffix = format!(".{}", ctx.extension);
    let Ok(entries) = fs::read_dir(&ctx.extras_dir) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        let name = e.file_name().to_string_lossy().into_owned();
        let path = e.path();
        name.starts_with(&prefix)
            && name.ends_with(&suffix)
            && path.is_file()
            && !output_is_locked(&path)
    })
}

/// Outputs planned by the manifests of the title's other discs.
pub fn reserved_outputs(ctx: &TitleContext, disc_dir: &Path) -> HashSet<PathBuf> {
    let Ok(entries) = fs::read_dir(&ctx.mkv_root) else {
        return HashSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p != disc_dir)
        .filter_map(|p| load_manifest(&p))
        .flat_map(|m| m.items.into_iter().map(|item| item.output))
        .collect()
}

/// Probe and plan a disc from scratch.
pub fn plan_disc(
    ctx: &TitleContext,
    disc: u32,
    disc_dir: &Path,
    mkvs: &[PathBuf],
    prober: &dyn MetadataProber,
) -> Result<Vec<PlanItem>, PlanError> {
    let files: Vec<_> = mkvs.iter().map(|p| probe_file(prober, p)).collect();
    let reserved = reserved_outputs(ctx, disc_dir);
    if ctx.is_series() {
        plan_series_disc(ctx, disc_dir, &files, &reserved)
    } else {
        plan_movie_disc(ctx, disc, disc_dir, &files, &reserved)
    }
}

fn load_or_plan(
    env: &DiscEnv<'_>,
    ctx: &TitleContext,
    disc: u32,
    disc_dir: &Path,
    mkvs: &[PathBuf],
) -> Result<Option<Vec<PlanItem>>, DiscError> {
    if let Some(manifest) = load_manifest(disc_dir) {
        if manifest.is_complete() {
            info!(
                "Resume: disc already processed (manifest complete): {}",
                disc_dir.display()
            );
            return Ok(None);
        }
        let missing = manifest.missing_items().count();
        info!(
            "Resume: reusing disc plan ({} of {} outputs missing): {}",
            missing,
            manifest.items.len(),
            disc_dir.display()
        );
        return Ok(Some(manifest.items));
    }

    if !ctx.is_series() && disc == 1 {
        if let Some(main) = ctx.main_file().filter(|m| m.exists()) {
            info!(
                "Resume: main feature already encoded, skipping disc: {}",
                main.display()
            );
            return Ok(None);
        }
    }

    let items = plan_disc(ctx, disc, disc_dir, mkvs, env.prober)?;
    let manifest = DiscManifest::new(
        ctx.kind(),
        &ctx.title,
        &ctx.year,
        &ctx.season_pad,
        disc_dir,
        items,
    );
    write_manifest(disc_dir, &manifest).map_err(|source| DiscError::Manifest {
        path: disc_dir.to_path_buf(),
        source,
    })?;
    info!(
        "Disc plan written: {} ({} items)",
        disc_dir.display(),
        manifest.items.len()
    );
    Ok(Some(manifest.items))
}

/// Resume or start processing one ripped disc.
///
/// Loads the disc's manifest; a complete one skips the disc, an incomplete
/// one is executed as is, and a missing one is planned and persisted first.
/// Each missing output is then submitted to the coordinator, after extracting
/// external subtitles when configured. Extras are registered in the
/// sidecar, which is closed once the disc is done.
///
/// # Errors
/// Planning, manifest write and encode submission failures.
pub fn process_disc(
    env: &DiscEnv<'_>,
    ctx: &TitleContext,
    disc: u32,
    disc_dir: &Path,
) -> Result<DiscOutcome, DiscError> {
    let mkvs = find_mkvs_in_dir(disc_dir);
    if mkvs.is_empty() {
        return Err(DiscError::NoMkvs(disc_dir.to_path_buf()));
    }

    let Some(items) = load_or_plan(env, ctx, disc, disc_dir, &mkvs)? else {
        close_extras_nfo(&ctx.extras_nfo)?;
        return Ok(DiscOutcome::AlreadyComplete);
    };

    let mut submitted = 0;
    for item in items.iter().filter(|item| !item.output.exists()) {
        if let Some(parent) = item.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let input = item.input_path(disc_dir);

        if env.subtitle_mode == SubtitleMode::External {
            extract_external_subtitles(env.prober, &input, &item.output);
        }
        if item.kind == PlanItemKind::Extra {
            register_extra(&ctx.extras_nfo, &item.output)?;
        }

        let job = EncodeJob::new(input, item.output.clone(), env.preset, env.subtitle_mode);
        if env.coordinator.submit(job)? != Submission::Skipped {
            submitted += 1;
        }
    }

    close_extras_nfo(&ctx.extras_nfo)?;
    Ok(DiscOutcome::Submitted {
        planned: items.len(),
        submitted,
    })
}

fn register_extra(nfo: &Path, output: &Path) -> io::Result<()> {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = output
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    append_extra_if_missing(nfo, &stem, &name).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelFlag;
    use crate::concurrency::EncodePlan;
    use crate::coordinator::testing::FakeTranscoder;
    use crate::lock::EncodeLock;
    use crate::manifest::manifest_path;
    use crate::probe::testing::FakeProber;
    use crate::title::{Destination, LibraryLayout, MediaSpec, TitleSpec};
    use disc_archiver_config::OutputContainer;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::runtime::Runtime;

    fn layout(root: &Path) -> LibraryLayout {
        let movies = root.join("Movies");
        let series = root.join("TV");
        fs::create_dir_all(&movies).unwrap();
        fs::create_dir_all(&series).unwrap();
        LibraryLayout {
            work_root: root.join("work"),
            movies: Destination::Local(movies),
            series: Destination::Local(series),
            container: OutputContainer::Mp4,
        }
    }

    fn title(name: &str, media: MediaSpec) -> TitleSpec {
        TitleSpec {
            title_raw: name.to_string(),
            year: "2002".to_string(),
            media,
        }
    }

    fn write_mkvs(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for (i, name) in names.iter().enumerate() {
            fs::write(dir.join(name), vec![0u8; 100 * (i + 1)]).unwrap();
        }
    }

    struct Harness {
        _rt: Runtime,
        fake: Arc<FakeTranscoder>,
        coord: EncodeCoordinator,
        prober: FakeProber,
    }

    impl Harness {
        fn new(prober: FakeProber) -> Self {
            let rt = Runtime::new().unwrap();
            let fake = Arc::new(FakeTranscoder::default());
            let coord = EncodeCoordinator::new(
                EncodePlan::inline(),
                Arc::clone(&fake) as Arc<dyn crate::encode::Transcoder>,
                rt.handle().clone(),
                CancelFlag::new(),
            );
            Self {
                _rt: rt,
                fake,
                coord,
                prober,
            }
        }

        fn env(&self) -> DiscEnv<'_> {
            DiscEnv {
                prober: &self.prober,
                coordinator: &self.coord,
                preset: "HQ 1080p30 Surround",
                subtitle_mode: SubtitleMode::None,
            }
        }
    }

    fn firefly_prober() -> FakeProber {
        FakeProber::default()
            .with("t00.mkv", 2600, 10, "")
            .with("t01.mkv", 300, 1, "Blooper Reel")
            .with("t02.mkv", 2500, 12, "")
    }

    #[test]
    fn test_series_disc_scenario() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Firefly", MediaSpec::Series { season: 1 }),
            &layout(root.path()),
        )
        .unwrap();
        let disc_dir = ctx.disc_dir(1);
        write_mkvs(&disc_dir, &["t00.mkv", "t01.mkv", "t02.mkv"]);
        let h = Harness::new(firefly_prober());

        let outcome = process_disc(&h.env(), &ctx, 1, &disc_dir).unwrap();
        assert_eq!(
            outcome,
            DiscOutcome::Submitted {
                planned: 3,
                submitted: 3
            }
        );

        let manifest = load_manifest(&disc_dir).unwrap();
        let episodes: Vec<_> = manifest
            .items
            .iter()
            .filter(|i| i.kind == PlanItemKind::Episode)
            .map(|i| (i.input_rel.clone(), i.output.file_name().unwrap().to_string_lossy().into_owned()))
            .collect();
        assert_eq!(
            episodes,
            vec![
                ("t00.mkv".to_string(), "Firefly - S01E01 - .mp4".to_string()),
                ("t02.mkv".to_string(), "Firefly - S01E02 - .mp4".to_string()),
            ]
        );
        let extra = manifest
            .items
            .iter()
            .find(|i| i.kind == PlanItemKind::Extra)
            .unwrap();
        assert_eq!(extra.output.file_name().unwrap(), "Blooper_Reel.mp4");

        let nfo = fs::read_to_string(&ctx.extras_nfo).unwrap();
        assert!(nfo.contains("<filename>Blooper_Reel.mp4</filename>"));
        assert!(nfo.trim_end().ends_with("</extras>"));
    }

    #[test]
    fn test_resume_submits_only_missing() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Firefly", MediaSpec::Series { season: 1 }),
            &layout(root.path()),
        )
        .unwrap();
        let disc_dir = ctx.disc_dir(1);
        write_mkvs(&disc_dir, &["t00.mkv", "t01.mkv", "t02.mkv"]);

        let first = Harness::new(firefly_prober());
        process_disc(&first.env(), &ctx, 1, &disc_dir).unwrap();

        let again = Harness::new(firefly_prober());
        assert_eq!(
            process_disc(&again.env(), &ctx, 1, &disc_dir).unwrap(),
            DiscOutcome::AlreadyComplete
        );
        assert!(again.fake.encoded_names().is_empty());

        let manifest = load_manifest(&disc_dir).unwrap();
        fs::remove_file(&manifest.items[1].output).unwrap();

        // A different probe result must not change the frozen plan.
        let changed = Harness::new(FakeProber::default());
        let outcome = process_disc(&changed.env(), &ctx, 1, &disc_dir).unwrap();
        assert_eq!(
            outcome,
            DiscOutcome::Submitted {
                planned: 3,
                submitted: 1
            }
        );
        assert_eq!(changed.fake.encoded.lock().unwrap().clone(), vec![manifest.items[1].output.clone()]);
        assert_eq!(load_manifest(&disc_dir).unwrap(), manifest);
    }

    #[test]
    fn test_episode_numbers_continue_across_discs() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Firefly", MediaSpec::Series { season: 1 }),
            &layout(root.path()),
        )
        .unwrap();
        let prober = FakeProber::default()
            .with("a.mkv", 2600, 10, "Serenity")
            .with("b.mkv", 2600, 10, "The Train Job")
            .with("c.mkv", 2600, 10, "Bushwhacked");
        write_mkvs(&ctx.disc_dir(1), &["a.mkv", "b.mkv"]);
        write_mkvs(&ctx.disc_dir(2), &["c.mkv"]);

        let h = Harness::new(prober);
        process_disc(&h.env(), &ctx, 1, &ctx.disc_dir(1)).unwrap();
        process_disc(&h.env(), &ctx, 2, &ctx.disc_dir(2)).unwrap();

        let mut names = h.fake.encoded_names();
        names.sort();
        assert_eq!(
            names,
            vec![
                "Firefly - S01E01 - Serenity.mp4",
                "Firefly - S01E02 - The_Train_Job.mp4",
                "Firefly - S01E03 - Bushwhacked.mp4",
            ]
        );
    }

    #[test]
    fn test_manifest_written_before_failed_encode() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Heat", MediaSpec::Movie { multi_disc: false }),
            &layout(root.path()),
        )
        .unwrap();
        let disc_dir = ctx.disc_dir(1);
        write_mkvs(&disc_dir, &["t00.mkv"]);

        let rt = Runtime::new().unwrap();
        let coord = EncodeCoordinator::new(
            EncodePlan::inline(),
            Arc::new(FakeTranscoder::failing("Heat.mp4")),
            rt.handle().clone(),
            CancelFlag::new(),
        );
        let prober = FakeProber::default().with("t00.mkv", 6000, 20, "");
        let env = DiscEnv {
            prober: &prober,
            coordinator: &coord,
            preset: "HQ 1080p30 Surround",
            subtitle_mode: SubtitleMode::None,
        };

        assert!(matches!(
            process_disc(&env, &ctx, 1, &disc_dir),
            Err(DiscError::Encode(_))
        ));
        assert!(manifest_path(&disc_dir).exists());
        let manifest = load_manifest(&disc_dir).unwrap();
        assert_eq!(manifest.items[0].kind, PlanItemKind::Main);
    }

    #[test]
    fn test_legacy_movie_disc_one_is_done() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Heat", MediaSpec::Movie { multi_disc: false }),
            &layout(root.path()),
        )
        .unwrap();
        let disc_dir = ctx.disc_dir(1);
        write_mkvs(&disc_dir, &["t00.mkv", "t01.mkv"]);
        fs::write(ctx.main_file().unwrap(), b"old").unwrap();

        let h = Harness::new(FakeProber::default());
        assert_eq!(
            process_disc(&h.env(), &ctx, 1, &disc_dir).unwrap(),
            DiscOutcome::AlreadyComplete
        );
        assert!(!manifest_path(&disc_dir).exists());
    }

    #[test]
    fn test_movie_outputs_exist_shortcut() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Heat", MediaSpec::Movie { multi_disc: true }),
            &layout(root.path()),
        )
        .unwrap();
        assert!(!movie_disc_outputs_exist(&ctx, 1));
        assert!(!movie_disc_outputs_exist(&ctx, 2));

        let main = ctx.main_file().unwrap().to_path_buf();
        fs::write(&main, b"x").unwrap();
        assert!(movie_disc_outputs_exist(&ctx, 1));
        let lock = EncodeLock::acquire(&main).unwrap();
        assert!(!movie_disc_outputs_exist(&ctx, 1));
        drop(lock);

        fs::write(ctx.extras_dir.join("Disc02_Making_Of.mp4"), b"x").unwrap();
        assert!(movie_disc_outputs_exist(&ctx, 2));
        assert!(!movie_disc_outputs_exist(&ctx, 3));
    }

    #[test]
    fn test_reserved_outputs_from_sibling_discs() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Heat", MediaSpec::Movie { multi_disc: true }),
            &layout(root.path()),
        )
        .unwrap();
        let sibling = ctx.disc_dir(2);
        let planned = ctx.extras_dir.join("Disc02_Extra.mp4");
        let manifest = DiscManifest::new(
            ctx.kind(),
            &ctx.title,
            &ctx.year,
            "",
            &sibling,
            vec![PlanItem::new(PlanItemKind::Extra, "t00.mkv", planned.clone())],
        );
        write_manifest(&sibling, &manifest).unwrap();

        let reserved = reserved_outputs(&ctx, &ctx.disc_dir(3));
        assert!(reserved.contains(&planned));
        assert!(reserved_outputs(&ctx, &sibling).is_empty());
    }

    #[test]
    fn test_empty_disc_dir_is_error() {
        let root = TempDir::new().unwrap();
        let ctx = TitleContext::setup(
            &title("Heat", MediaSpec::Movie { multi_disc: false }),
            &layout(root.path()),
        )
        .unwrap();
        let h = Harness::new(FakeProber::default());
        assert!(matches!(
            process_disc(&h.env(), &ctx, 1, &ctx.disc_dir(1)),
            Err(DiscError::NoMkvs(_))
        ));
    }
}
