//! Output path planning.
//!
//! Turns a classified disc into a list of [`PlanItem`]s: which ripped file
//! becomes the main feature, which episode number each series file gets,
//! and which collision-free name each extra is stored under.

use crate::classify::{classify, plan_order};
use crate::lock::{encode_lock_path, lock_is_stale_or_clear};
use crate::manifest::{PlanItem, PlanItemKind};
use crate::naming::clean_title;
use crate::probe::MediaFile;
use crate::title::TitleContext;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Highest numeric suffix tried when an extra's name is taken.
pub const MAX_COLLISION_SUFFIX: u32 = 99;

/// Name used for extras without a usable title tag.
pub const DEFAULT_EXTRA_NAME: &str = "Extra";

static EPISODE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"E(\d{2})").expect("valid regex"));

/// Error type for planning operations
#[derive(Debug, Error)]
pub enum PlanError {
    /// Every `-NN` suffix for an extra is already in use
    #[error("Could not find a free filename for: {dir}/{stem}.{ext}")]
    NoFreeName { dir: PathBuf, stem: String, ext: String },

    /// The disc has no files to plan
    #[error("No MKVs to plan in {0}")]
    NoFiles(PathBuf),

    /// The title is not of the kind the planner was asked for
    #[error("Title {0} has no {1} output")]
    WrongKind(String, &'static str),
}

/// Pick a free output path for an extra.
///
/// `<stem>.<ext>` is used if neither it nor a live lock for it exists and it
/// is not in `taken`; otherwise `<stem>-02` through `<stem>-99` are tried in
/// order. Stale locks found along the way are removed.
pub fn unique_extra_path(
    extras_dir: &Path,
    stem: &str,
    ext: &str,
    taken: &HashSet<PathBuf>,
) -> Result<PathBuf, PlanError> {
    let candidates = std::iter::once(format!("{}.{}", stem, ext)).chain(
        (2..=MAX_COLLISION_SUFFIX).map(|i| format!("{}-{:02}.{}", stem, i, ext)),
    );

    for name in candidates {
        let out = extras_dir.join(name);
        let lock = encode_lock_path(&out);
        lock_is_stale_or_clear(&lock);
        if !out.exists() && !lock.exists() && !taken.contains(&out) {
            return Ok(out);
        }
    }

    Err(PlanError::NoFreeName {
        dir: extras_dir.to_path_buf(),
        stem: stem.to_string(),
        ext: ext.to_string(),
    })
}

fn episode_number_in(name: &str) -> Option<u32> {
    EPISODE_NUMBER
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Next free episode number in a season folder.
///
/// One more than the highest `E<NN>` found in any entry name of
/// `season_dir` or in `reserved` (outputs already planned elsewhere). An
/// empty or missing folder starts at 1.
pub fn next_episode_number(season_dir: &Path, reserved: &HashSet<PathBuf>) -> u32 {
    let on_disk = fs::read_dir(season_dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter_map(|e| episode_number_in(&e.file_name().to_string_lossy()));
    let planned = reserved
        .iter()
        .filter(|p| p.parent() == Some(season_dir))
        .filter_map(|p| p.file_name())
        .filter_map(|n| episode_number_in(&n.to_string_lossy()));

    on_disk.chain(planned).max().unwrap_or(0) + 1
}

/// `<title> - S<SS>E<NN> - <clean>.<ext>`
pub fn episode_file_name(title: &str, season_pad: &str, episode: u32, clean: &str, ext: &str) -> String {
    format!("{} - S{}E{:02} - {}.{}", title, season_pad, episode, clean, ext)
}

/// Find an episode file produced by an earlier run for the same title tag.
///
/// Only used when the tag cleans to a non-empty name. Picks the first match
/// in name order.
pub fn find_existing_episode_output(
    season_dir: &Path,
    title: &str,
    season_pad: &str,
    clean: &str,
    ext: &str,
) -> Option<PathBuf> {
    if clean.is_empty() {
        return None;
    }
    let pattern = format!(
        r"^{} - S{}E\d{{2}} - {}\.{}$",
        regex::escape(title),
        regex::escape(season_pad),
        regex::escape(clean),
        regex::escape(ext)
    );
    let re = Regex::new(&pattern).ok()?;

    let mut matches: Vec<PathBuf> = fs::read_dir(season_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter(|e| re.is_match(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

fn input_rel(disc_dir: &Path, path: &Path) -> String {
    path.strip_prefix(disc_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn extra_stem(prefix: &str, title_tag: &str) -> String {
    let clean = clean_title(title_tag);
    if clean.is_empty() {
        format!("{}{}", prefix, DEFAULT_EXTRA_NAME)
    } else {
        format!("{}{}", prefix, clean)
    }
}

/// Plan a series disc.
///
/// Files are taken in [`plan_order`]. Extras get unique names in the season's
/// `Extras/` folder; everything else becomes the next episode, unless an
/// earlier run already produced an episode with the same cleaned title.
///
/// # Arguments
/// * `ctx` - Title the disc belongs to
/// * `disc_dir` - Directory holding the ripped files
/// * `files` - Probed files of the disc
/// * `reserved` - Outputs already planned for other discs of this title
pub fn plan_series_disc(
    ctx: &TitleContext,
    disc_dir: &Path,
    files: &[MediaFile],
    reserved: &HashSet<PathBuf>,
) -> Result<Vec<PlanItem>, PlanError> {
    let season_dir = ctx
        .season_dir()
        .ok_or_else(|| PlanError::WrongKind(ctx.display_name(), "season"))?;
    if files.is_empty() {
        return Err(PlanError::NoFiles(disc_dir.to_path_buf()));
    }

    let classification = classify(files);
    let mut taken: HashSet<PathBuf> = reserved.clone();
    let mut next_episode = next_episode_number(season_dir, reserved);
    let mut items = Vec::with_capacity(files.len());

    for file in plan_order(files.to_vec()) {
        let rel = input_rel(disc_dir, &file.path);

        if classification.is_extra(&file.path) {
            let stem = extra_stem("", &file.facts.title_tag);
            let out = unique_extra_path(&ctx.extras_dir, &stem, ctx.extension, &taken)?;
            taken.insert(out.clone());
            items.push(PlanItem::new(PlanItemKind::Extra, rel, out));
            continue;
        }

        let clean = clean_title(&file.facts.title_tag);
        let existing = find_existing_episode_output(
            season_dir,
            &ctx.title,
            &ctx.season_pad,
            &clean,
            ctx.extension,
        )
        .filter(|p| !taken.contains(p));

        let out = match existing {
            Some(out) => out,
            None => {
                let name = episode_file_name(
                    &ctx.title,
                    &ctx.season_pad,
                    next_episode,
                    &clean,
                    ctx.extension,
                );
                next_episode += 1;
                season_dir.join(name)
            }
        };
        taken.insert(out.clone());
        items.push(PlanItem::new(PlanItemKind::Episode, rel, out));
    }

    Ok(items)
}

/// Plan a movie disc.
///
/// Disc 1 maps its main feature to the title's main file and every other
/// file to an extra named after its title tag. Later discs only hold extras,
/// prefixed `Disc<NN>_`.
///
/// # Arguments
/// * `ctx` - Title the disc belongs to
/// * `disc_index` - 1-based disc number
/// * `disc_dir` - Directory holding the ripped files
/// * `files` - Probed files of the disc
/// * `reserved` - Outputs already planned for other discs of this title
pub fn plan_movie_disc(
    ctx: &TitleContext,
    disc_index: u32,
    disc_dir: &Path,
    files: &[MediaFile],
    reserved: &HashSet<PathBuf>,
) -> Result<Vec<PlanItem>, PlanError> {
    let main_output = ctx
        .main_file()
        .ok_or_else(|| PlanError::WrongKind(ctx.display_name(), "movie"))?;
    if files.is_empty() {
        return Err(PlanError::NoFiles(disc_dir.to_path_buf()));
    }

    let mut taken: HashSet<PathBuf> = reserved.clone();
    let mut items = Vec::with_capacity(files.len());

    if disc_index <= 1 {
        let classification = classify(files);
        let main = classification.main_file.clone();
        if let Some(main) = &main {
            items.push(PlanItem::new(
                PlanItemKind::Main,
                input_rel(disc_dir, main),
                main_output.to_path_buf(),
            ));
            taken.insert(main_output.to_path_buf());
        }

        for file in plan_order(files.to_vec()) {
            if main.as_deref() == Some(file.path.as_path()) {
                continue;
            }
            let stem = extra_stem("", &file.facts.title_tag);
            let out = unique_extra_path(&ctx.extras_dir, &stem, ctx.extension, &taken)?;
            taken.insert(out.clone());
            items.push(PlanItem::new(
                PlanItemKind::Extra,
                input_rel(disc_dir, &file.path),
                out,
            ));
        }
    } else {
        let prefix = format!("Disc{:02}_", disc_index);
        for file in files {
            let stem = extra_stem(&prefix, &file.facts.title_tag);
            let out = unique_extra_path(&ctx.extras_dir, &stem, ctx.extension, &taken)?;
            taken.insert(out.clone());
            items.push(PlanItem::new(
                PlanItemKind::Extra,
                input_rel(disc_dir, &file.path),
                out,
            ));
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::reserved_outputs;
    use crate::manifest::{write_manifest, DiscManifest};
    use crate::probe::MediaFacts;
    use crate::title::{Destination, LibraryLayout, MediaSpec, TitleSpec};
    use disc_archiver_config::OutputContainer;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn layout(root: &Path) -> LibraryLayout {
        LibraryLayout {
            work_root: root.join("work"),
            movies: Destination::Local(root.join("Movies")),
            series: Destination::Local(root.join("TV")),
            container: OutputContainer::Mp4,
        }
    }

    fn series_ctx(root: &Path) -> TitleContext {
        TitleContext::setup(
            &TitleSpec {
                title_raw: "Firefly".to_string(),
                year: "2002".to_string(),
                media: MediaSpec::Series { season: 1 },
            },
            &layout(root),
        )
        .unwrap()
    }

    fn movie_ctx(root: &Path) -> TitleContext {
        TitleContext::setup(
            &TitleSpec {
                title_raw: "Heat".to_string(),
                year: "1995".to_string(),
                media: MediaSpec::Movie { multi_disc: true },
            },
            &layout(root),
        )
        .unwrap()
    }

    fn media(disc_dir: &Path, name: &str, duration: u64, chapters: u32, title: &str) -> MediaFile {
        MediaFile {
            path: disc_dir.join(name),
            facts: MediaFacts {
                duration_seconds: duration,
                chapter_count: chapters,
                title_tag: title.to_string(),
            },
            size_bytes: 1 << 20,
        }
    }

    fn names(items: &[PlanItem]) -> Vec<String> {
        items
            .iter()
            .map(|i| i.output.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_unique_extra_path_collisions() {
        let dir = TempDir::new().unwrap();
        let taken = HashSet::new();

        let first = unique_extra_path(dir.path(), "Trailer", "mp4", &taken).unwrap();
        assert_eq!(first, dir.path().join("Trailer.mp4"));

        fs::write(&first, b"x").unwrap();
        let second = unique_extra_path(dir.path(), "Trailer", "mp4", &taken).unwrap();
        assert_eq!(second, dir.path().join("Trailer-02.mp4"));

        // A live lock blocks a name just like an existing file.
        fs::write(
            encode_lock_path(&second),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        let third = unique_extra_path(dir.path(), "Trailer", "mp4", &taken).unwrap();
        assert_eq!(third, dir.path().join("Trailer-03.mp4"));
    }

    #[test]
    fn test_unique_extra_path_respects_taken() {
        let dir = TempDir::new().unwrap();
        let mut taken = HashSet::new();
        taken.insert(dir.path().join("Extra.mp4"));
        let out = unique_extra_path(dir.path(), "Extra", "mp4", &taken).unwrap();
        assert_eq!(out, dir.path().join("Extra-02.mp4"));
    }

    #[test]
    fn test_unique_extra_path_exhaustion() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Extra.mp4"), b"x").unwrap();
        for i in 2..=MAX_COLLISION_SUFFIX {
            fs::write(dir.path().join(format!("Extra-{:02}.mp4", i)), b"x").unwrap();
        }
        let err = unique_extra_path(dir.path(), "Extra", "mp4", &HashSet::new()).unwrap_err();
        assert!(matches!(err, PlanError::NoFreeName { .. }));
    }

    #[test]
    fn test_next_episode_number() {
        let dir = TempDir::new().unwrap();
        assert_eq!(next_episode_number(&dir.path().join("missing"), &HashSet::new()), 1);
        assert_eq!(next_episode_number(dir.path(), &HashSet::new()), 1);

        fs::write(dir.path().join("Show - S01E03 - .mp4"), b"x").unwrap();
        fs::write(dir.path().join("Show - S01E07 - Pilot.mp4.enc.lock"), b"1").unwrap();
        assert_eq!(next_episode_number(dir.path(), &HashSet::new()), 8);

        let mut reserved = HashSet::new();
        reserved.insert(dir.path().join("Show - S01E12 - .mp4"));
        reserved.insert(dir.path().join("Extras").join("E99.mp4"));
        assert_eq!(next_episode_number(dir.path(), &reserved), 13);
    }

    #[test]
    fn test_episode_file_name() {
        assert_eq!(
            episode_file_name("Firefly", "01", 3, "Bushwhacked", "mp4"),
            "Firefly - S01E03 - Bushwhacked.mp4"
        );
    }

    #[test]
    fn test_series_disc_scenario() {
        let dir = TempDir::new().unwrap();
        let ctx = series_ctx(dir.path());
        let disc = ctx.disc_dir(1);
        let files = vec![
            media(&disc, "title_t00.mkv", 2600, 10, ""),
            media(&disc, "title_t01.mkv", 300, 1, "Blooper Reel"),
            media(&disc, "title_t02.mkv", 2500, 12, ""),
        ];

        let items = plan_series_disc(&ctx, &disc, &files, &HashSet::new()).unwrap();
        assert_eq!(
            names(&items),
            vec![
                "Firefly - S01E01 - .mp4",
                "Blooper_Reel.mp4",
                "Firefly - S01E02 - .mp4",
            ]
        );
        assert_eq!(items[0].kind, PlanItemKind::Episode);
        assert_eq!(items[0].input_rel, "title_t00.mkv");
        assert_eq!(items[1].kind, PlanItemKind::Extra);
        assert_eq!(items[1].output.parent(), Some(ctx.extras_dir.as_path()));
        assert_eq!(items[2].input_rel, "title_t02.mkv");
    }

    #[test]
    fn test_series_numbering_continues_across_discs() {
        let dir = TempDir::new().unwrap();
        let ctx = series_ctx(dir.path());
        let season = ctx.season_dir().unwrap().to_path_buf();

        let disc1 = ctx.disc_dir(1);
        let first = plan_series_disc(
            &ctx,
            &disc1,
            &[
                media(&disc1, "t00.mkv", 2600, 10, "Serenity"),
                media(&disc1, "t01.mkv", 2600, 10, "The Train Job"),
            ],
            &HashSet::new(),
        )
        .unwrap();
        // Only the first output has been encoded so far.
        fs::write(&first[0].output, b"x").unwrap();

        let reserved: HashSet<PathBuf> = first.iter().map(|i| i.output.clone()).collect();
        let disc2 = ctx.disc_dir(2);
        let second = plan_series_disc(
            &ctx,
            &disc2,
            &[media(&disc2, "t00.mkv", 2600, 10, "Bushwhacked")],
            &reserved,
        )
        .unwrap();

        assert_eq!(
            second[0].output,
            season.join("Firefly - S01E03 - Bushwhacked.mp4")
        );
    }

    #[test]
    fn test_series_reuses_legacy_episode_output() {
        let dir = TempDir::new().unwrap();
        let ctx = series_ctx(dir.path());
        let season = ctx.season_dir().unwrap().to_path_buf();
        fs::write(season.join("Firefly - S01E05 - Out_of_Gas.mp4"), b"x").unwrap();

        let disc = ctx.disc_dir(2);
        let items = plan_series_disc(
            &ctx,
            &disc,
            &[
                media(&disc, "t00.mkv", 2600, 10, "Out of Gas"),
                media(&disc, "t01.mkv", 2600, 10, "Ariel"),
            ],
            &HashSet::new(),
        )
        .unwrap();

        assert_eq!(items[0].output, season.join("Firefly - S01E05 - Out_of_Gas.mp4"));
        assert_eq!(items[1].output, season.join("Firefly - S01E06 - Ariel.mp4"));
    }

    #[test]
    fn test_series_same_named_extras_get_distinct_paths() {
        let dir = TempDir::new().unwrap();
        let ctx = series_ctx(dir.path());
        let disc = ctx.disc_dir(1);
        let items = plan_series_disc(
            &ctx,
            &disc,
            &[
                media(&disc, "t00.mkv", 100, 1, "Trailer"),
                media(&disc, "t01.mkv", 100, 1, "Trailer"),
            ],
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(names(&items), vec!["Trailer.mp4", "Trailer-02.mp4"]);
    }

    #[test]
    fn test_movie_disc_one() {
        let dir = TempDir::new().unwrap();
        let ctx = movie_ctx(dir.path());
        let disc = ctx.disc_dir(1);
        let items = plan_movie_disc(
            &ctx,
            1,
            &disc,
            &[
                media(&disc, "t00.mkv", 150, 1, "Theatrical Trailer"),
                media(&disc, "t01.mkv", 6000, 30, "Heat"),
                media(&disc, "t02.mkv", 900, 4, ""),
            ],
            &HashSet::new(),
        )
        .unwrap();

        assert_eq!(items[0].kind, PlanItemKind::Main);
        assert_eq!(items[0].input_rel, "t01.mkv");
        assert_eq!(Some(items[0].output.as_path()), ctx.main_file());
        assert_eq!(
            names(&items[1..]),
            vec!["Theatrical_Trailer.mp4", "Extra.mp4"]
        );
    }

    #[test]
    fn test_movie_later_disc_prefixes_extras() {
        let dir = TempDir::new().unwrap();
        let ctx = movie_ctx(dir.path());
        let disc = ctx.disc_dir(2);
        let items = plan_movie_disc(
            &ctx,
            2,
            &disc,
            &[
                media(&disc, "t00.mkv", 1500, 8, "Making Of"),
                media(&disc, "t01.mkv", 600, 1, "!!!"),
            ],
            &HashSet::new(),
        )
        .unwrap();
        assert!(items.iter().all(|i| i.kind == PlanItemKind::Extra));
        assert_eq!(names(&items), vec!["Disc02_Making_Of.mp4", "Disc02_Extra.mp4"]);
    }

    #[test]
    fn test_empty_disc_is_error() {
        let dir = TempDir::new().unwrap();
        let ctx = movie_ctx(dir.path());
        let disc = ctx.disc_dir(1);
        assert!(matches!(
            plan_movie_disc(&ctx, 1, &disc, &[], &HashSet::new()),
            Err(PlanError::NoFiles(_))
        ));
    }

    #[test]
    fn test_wrong_kind_is_error() {
        let dir = TempDir::new().unwrap();
        let ctx = movie_ctx(dir.path());
        let disc = ctx.disc_dir(1);
        let files = [media(&disc, "t00.mkv", 2600, 10, "")];
        assert!(matches!(
            plan_series_disc(&ctx, &disc, &files, &HashSet::new()),
            Err(PlanError::WrongKind(..))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Planned outputs within a disc never collide.
        #[test]
        fn prop_series_outputs_are_distinct(
            specs in prop::collection::vec((0u64..4000, 0u32..20, "[A-Za-z ]{0,8}"), 1..10),
        ) {
            let dir = TempDir::new().unwrap();
            let ctx = series_ctx(dir.path());
            let disc = ctx.disc_dir(1);
            let files: Vec<MediaFile> = specs
                .iter()
                .enumerate()
                .map(|(i, (d, c, t))| media(&disc, &format!("t{:02}.mkv", i), *d, *c, t))
                .collect();

            let items = plan_series_disc(&ctx, &disc, &files, &HashSet::new()).unwrap();
            let unique: HashSet<&PathBuf> = items.iter().map(|i| &i.output).collect();
            prop_assert_eq!(unique.len(), items.len());
            prop_assert_eq!(items.len(), files.len());
        }

        /// Episode numbers run 1..=N across discs planned one at a time, even
        /// when earlier discs exist only as manifests with nothing encoded.
        #[test]
        fn prop_episode_numbers_are_contiguous_across_discs(
            discs in prop::collection::vec((1usize..4, any::<bool>()), 1..5),
        ) {
            let dir = TempDir::new().unwrap();
            let ctx = series_ctx(dir.path());
            let mut numbers = Vec::new();
            let mut next_file = 0u8;

            for (k, (count, encoded)) in discs.iter().enumerate() {
                let disc_dir = ctx.disc_dir(k as u32 + 1);
                let files: Vec<MediaFile> = (0..*count)
                    .map(|i| {
                        let tag = format!("Story {}", (b'A' + next_file) as char);
                        next_file += 1;
                        media(&disc_dir, &format!("t{:02}.mkv", i), 2600, 10, &tag)
                    })
                    .collect();

                let reserved = reserved_outputs(&ctx, &disc_dir);
                let items = plan_series_disc(&ctx, &disc_dir, &files, &reserved).unwrap();
                let manifest = DiscManifest::new(
                    ctx.kind(),
                    &ctx.title,
                    &ctx.year,
                    &ctx.season_pad,
                    &disc_dir,
                    items.clone(),
                );
                write_manifest(&disc_dir, &manifest).unwrap();
                if *encoded {
                    for item in &items {
                        fs::write(&item.output, b"x").unwrap();
                    }
                }

                for item in &items {
                    prop_assert_eq!(item.kind, PlanItemKind::Episode);
                    let name = item.output.file_name().unwrap().to_string_lossy().into_owned();
                    numbers.push(episode_number_in(&name).unwrap());
                }
            }

            let total: usize = discs.iter().map(|(count, _)| count).sum();
            prop_assert_eq!(numbers, (1..=total as u32).collect::<Vec<_>>());
        }
    }
}
