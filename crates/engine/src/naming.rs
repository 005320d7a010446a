//! Name sanitizing for library folders and output files.
//!
//! Two flavours exist: [`sanitize_title`] produces shell-friendly folder names
//! for a whole title, while [`clean_title`] is the looser variant applied to
//! episode and extra names that live under an already-sanitized parent.

use once_cell::sync::Lazy;
use regex::Regex;

/// Folder name used when nothing usable is left after sanitizing.
pub const UNTITLED: &str = "Untitled";

static DISALLOWED_DIR_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._\- ]+").expect("valid regex"));
static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("valid regex"));
static NON_ALNUM_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9 ]").expect("valid regex"));

/// Maps arbitrary title text to a filesystem-safe folder name.
///
/// Total function: never fails, never returns an empty string.
///
/// 1. Trim; empty input yields `Untitled`
/// 2. Path separators become `_`
/// 3. Anything outside `[A-Za-z0-9._- ]` becomes `_`
/// 4. Spaces become `_`, runs of `_` collapse to one
/// 5. Leading/trailing `.`, `_` and `-` are stripped
pub fn sanitize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return UNTITLED.to_string();
    }

    let s = trimmed.replace(['/', std::path::MAIN_SEPARATOR], "_");
    let s = DISALLOWED_DIR_CHARS.replace_all(&s, "_");
    let s = s.replace(' ', "_");
    let s = UNDERSCORE_RUNS.replace_all(&s, "_");
    let s = s.trim_matches(|c| c == '.' || c == '_' || c == '-');

    if s.is_empty() {
        UNTITLED.to_string()
    } else {
        s.to_string()
    }
}

/// Drops every character that is not ASCII alphanumeric or space, then maps
/// spaces to `_`.
///
/// Used for episode and extra file names. May return an empty string.
pub fn clean_title(raw: &str) -> String {
    NON_ALNUM_SPACE.replace_all(raw, "").replace(' ', "_")
}
