//! Schedule sources.
//!
//! A schedule is an ordered sequence of discs to process. It comes either
//! from a CSV file (one row per disc) or from operator answers in
//! interactive mode.

use crate::operator::{ask_nonempty, ask_number, ask_year, ask_yes_no, Operator};
use crate::title::{MediaSpec, TitleSpec};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

static HEADER_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(movie|series)?\s*name\s*,\s*year\s*,").expect("valid regex")
});

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

/// Error type for schedule loading and interactive input
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A CSV row failed to parse or validate
    #[error("CSV error at line {line}: {message}\n  Line: {text}")]
    Parse {
        line: usize,
        message: &'static str,
        text: String,
    },

    /// The CSV file held no rows
    #[error("CSV schedule is empty: {}", .0.display())]
    Empty(PathBuf),

    /// The CSV file could not be read
    #[error("Cannot read CSV file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    /// Operator input failed
    #[error("Operator input failed: {0}")]
    Operator(#[from] io::Error),
}

/// One disc to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRow {
    pub spec: TitleSpec,
    /// 1-based disc number within the title.
    pub disc: u32,
    /// Source line in the CSV file; 0 for interactive rows.
    pub line: usize,
    /// Season column exactly as written in the CSV, e.g. `01`.
    pub season_text: Option<String>,
}

impl ScheduleRow {
    /// The operator prompt asking for this disc.
    pub fn insert_prompt(&self) -> String {
        let TitleSpec {
            title_raw, year, ..
        } = &self.spec;
        match self.spec.media {
            MediaSpec::Movie { multi_disc: true } => format!(
                "Insert: Movie '{} ({})' Disc {} (MultiDisc=y). Press Enter when ready.",
                title_raw, year, self.disc
            ),
            MediaSpec::Movie { multi_disc: false } => format!(
                "Insert: Movie '{} ({})' Disc {}. Press Enter when ready.",
                title_raw, year, self.disc
            ),
            MediaSpec::Series { season } => format!(
                "Insert: Series '{} ({})' Season {} Disc {}. Press Enter when ready.",
                title_raw,
                year,
                self.season_text.clone().unwrap_or_else(|| season.to_string()),
                self.disc
            ),
        }
    }
}

/// An ordered source of discs.
pub trait ScheduleSource {
    /// The next disc, or `None` when the schedule is exhausted.
    fn next_disc(&mut self, operator: &dyn Operator) -> Result<Option<ScheduleRow>, ScheduleError>;

    /// The disc after the current one, when it is known up front.
    fn peek_next(&self) -> Option<&ScheduleRow>;

    /// Whether this is an unattended multi-disc batch (implies overlap).
    fn is_batch(&self) -> bool;
}

fn parse_multi_disc(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "y" | "yes" | "true" => Some(true),
        "n" | "no" | "false" => Some(false),
        _ => None,
    }
}

/// Parse CSV schedule text.
///
/// Each row is `name,year,third,disc`, where `third` is a y/n multi-disc
/// flag (movie) or a season number (series). Blank lines, `#` comments, a
/// leading BOM and header rows are skipped.
pub fn parse_csv_schedule(text: &str) -> Result<Vec<ScheduleRow>, ScheduleError> {
    let mut rows = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let n = idx + 1;
        let line = raw.trim_end_matches('\r');
        let line = if n == 1 {
            line.trim_start_matches('\u{feff}')
        } else {
            line
        };
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        if HEADER_ROW.is_match(line) {
            continue;
        }

        let err = |message: &'static str| ScheduleError::Parse {
            line: n,
            message,
            text: line.to_string(),
        };

        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(err("expected exactly 4 comma-separated columns"));
        }
        let (name, year, third, disc) = (parts[0], parts[1], parts[2], parts[3]);

        if !YEAR.is_match(year) {
            return Err(err("year must be 4 digits"));
        }
        let disc = match disc.parse::<u32>() {
            Ok(d) if d >= 1 && disc.chars().all(|c| c.is_ascii_digit()) => d,
            _ => return Err(err("disc must be an integer >= 1")),
        };

        let media = match parse_multi_disc(third) {
            Some(multi_disc) => MediaSpec::Movie { multi_disc },
            None => match third.parse::<u32>() {
                Ok(season) if season >= 1 && third.chars().all(|c| c.is_ascii_digit()) => {
                    MediaSpec::Series { season }
                }
                _ => return Err(err("season must be an integer >= 1")),
            },
        };

        let season_text = matches!(media, MediaSpec::Series { .. }).then(|| third.to_string());
        rows.push(ScheduleRow {
            spec: TitleSpec {
                title_raw: name.to_string(),
                year: year.to_string(),
                media,
            },
            disc,
            line: n,
            season_text,
        });
    }

    Ok(rows)
}

/// Load and validate a CSV schedule file.
pub fn load_csv_schedule(path: &Path) -> Result<Vec<ScheduleRow>, ScheduleError> {
    let bytes = fs::read(path).map_err(|source| ScheduleError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let rows = parse_csv_schedule(&String::from_utf8_lossy(&bytes))?;
    if rows.is_empty() {
        return Err(ScheduleError::Empty(path.to_path_buf()));
    }
    Ok(rows)
}

/// Schedule read from a CSV file.
#[derive(Debug, Clone)]
pub struct CsvSchedule {
    rows: Vec<ScheduleRow>,
    next: usize,
}

impl CsvSchedule {
    pub fn new(rows: Vec<ScheduleRow>) -> Self {
        Self { rows, next: 0 }
    }

    pub fn load(path: &Path) -> Result<Self, ScheduleError> {
        load_csv_schedule(path).map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl ScheduleSource for CsvSchedule {
    fn next_disc(&mut self, _operator: &dyn Operator) -> Result<Option<ScheduleRow>, ScheduleError> {
        let row = self.rows.get(self.next).cloned();
        if row.is_some() {
            self.next += 1;
        }
        Ok(row)
    }

    fn peek_next(&self) -> Option<&ScheduleRow> {
        self.rows.get(self.next)
    }

    fn is_batch(&self) -> bool {
        true
    }
}

/// Schedule built from operator answers, one title at a time.
#[derive(Debug, Clone)]
pub struct InteractiveSchedule {
    continuous: bool,
    current: Option<ScheduleRow>,
}

impl InteractiveSchedule {
    /// `continuous`: offer another title once the current one is done.
    pub fn new(continuous: bool) -> Self {
        Self {
            continuous,
            current: None,
        }
    }

    fn ask_title(operator: &dyn Operator) -> Result<TitleSpec, ScheduleError> {
        let title_raw = ask_nonempty(operator, "Enter title (Movie or Series name): ")?;
        let year = ask_year(operator, "Enter release year: ")?;
        let media = if ask_yes_no(operator, "Is this a series? (y/n): ")? {
            MediaSpec::Series {
                season: ask_number(operator, "Enter season number: ")?,
            }
        } else {
            MediaSpec::Movie {
                multi_disc: ask_yes_no(
                    operator,
                    "Is this a multi-disc movie (disc 2+ are extras)? (y/n): ",
                )?,
            }
        };
        Ok(TitleSpec {
            title_raw,
            year,
            media,
        })
    }

    fn another_disc(operator: &dyn Operator, row: &ScheduleRow) -> Result<bool, ScheduleError> {
        let question = match row.spec.media {
            MediaSpec::Series { .. } => "Insert next disc for this season? (y/n): ",
            MediaSpec::Movie { multi_disc: true } => {
                "Rip another disc for this movie (extras only)? (y/n): "
            }
            MediaSpec::Movie { multi_disc: false } => return Ok(false),
        };
        Ok(ask_yes_no(operator, question)?)
    }
}

impl ScheduleSource for InteractiveSchedule {
    fn next_disc(&mut self, operator: &dyn Operator) -> Result<Option<ScheduleRow>, ScheduleError> {
        let next = match self.current.take() {
            None => ScheduleRow {
                spec: Self::ask_title(operator)?,
                disc: 1,
                line: 0,
                season_text: None,
            },
            Some(prev) if Self::another_disc(operator, &prev)? => ScheduleRow {
                disc: prev.disc + 1,
                ..prev
            },
            Some(_) => {
                if !self.continuous || !ask_yes_no(operator, "Start another title now? (y/n): ")? {
                    return Ok(None);
                }
                ScheduleRow {
                    spec: Self::ask_title(operator)?,
                    disc: 1,
                    line: 0,
                    season_text: None,
                }
            }
        };
        self.current = Some(next.clone());
        Ok(Some(next))
    }

    fn peek_next(&self) -> Option<&ScheduleRow> {
        None
    }

    fn is_batch(&self) -> bool {
        self.continuous
    }
}
