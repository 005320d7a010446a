//! `extras.nfo` sidecar maintenance.
//!
//! Each title's `Extras/` folder carries an `extras.nfo` listing the encoded
//! extras so media servers show them with readable names. The file is opened
//! with `<extras>`, grows one `<video>` block per extra and is closed with
//! `</extras>` once a disc is done.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Sidecar file name inside an extras folder.
pub const EXTRAS_NFO_NAME: &str = "extras.nfo";

const OPEN_TAG: &str = "<extras>";
const CLOSE_TAG: &str = "</extras>";

/// Creates the sidecar with its opening tag if it does not exist yet.
///
/// # Arguments
///
/// * `nfo` - Path to the `extras.nfo` file
pub fn init_extras_nfo(nfo: &Path) -> io::Result<()> {
    if nfo.exists() {
        return Ok(());
    }
    fs::write(nfo, format!("{}\n", OPEN_TAG))
}

/// Appends a `<video>` entry unless one for `filename` is already present.
///
/// Returns `true` if an entry was written. A closed sidecar is reopened by
/// dropping its closing tag first, so later discs can still add extras.
///
/// # Arguments
///
/// * `nfo` - Path to the `extras.nfo` file
/// * `title` - Display title for the extra
/// * `filename` - File name of the encoded extra, relative to the extras folder
pub fn append_extra_if_missing(nfo: &Path, title: &str, filename: &str) -> io::Result<bool> {
    let existing = fs::read_to_string(nfo).unwrap_or_default();
    if existing.contains(&format!("<filename>{}</filename>", filename)) {
        return Ok(false);
    }

    if existing.contains(CLOSE_TAG) {
        fs::write(nfo, existing.replace(&format!("{}\n", CLOSE_TAG), ""))?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(nfo)?;
    write!(
        file,
        "  <video>\n    <title>{}</title>\n    <filename>{}</filename>\n  </video>\n",
        title, filename
    )?;
    Ok(true)
}

/// Appends the closing tag if the sidecar exists and is not closed yet.
pub fn close_extras_nfo(nfo: &Path) -> io::Result<()> {
    if !nfo.exists() {
        return Ok(());
    }
    let existing = fs::read_to_string(nfo)?;
    if existing.contains(CLOSE_TAG) {
        return Ok(());
    }
    let mut file = OpenOptions::new().append(true).open(nfo)?;
    writeln!(file, "{}", CLOSE_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_full_lifecycle() {
        let dir = TempDir::new().unwrap();
        let nfo = dir.path().join(EXTRAS_NFO_NAME);

        init_extras_nfo(&nfo).unwrap();
        assert!(append_extra_if_missing(&nfo, "Blooper_Reel", "Blooper_Reel.mp4").unwrap());
        close_extras_nfo(&nfo).unwrap();

        let content = fs::read_to_string(&nfo).unwrap();
        assert_eq!(
            content,
            "<extras>\n  <video>\n    <title>Blooper_Reel</title>\n    <filename>Blooper_Reel.mp4</filename>\n  </video>\n</extras>\n"
        );
    }

    #[test]
    fn test_append_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let nfo = dir.path().join(EXTRAS_NFO_NAME);
        init_extras_nfo(&nfo).unwrap();

        assert!(append_extra_if_missing(&nfo, "Trailer", "Trailer.mp4").unwrap());
        assert!(!append_extra_if_missing(&nfo, "Trailer", "Trailer.mp4").unwrap());

        let content = fs::read_to_string(&nfo).unwrap();
        assert_eq!(content.matches("<video>").count(), 1);
    }

    #[test]
    fn test_init_does_not_clobber() {
        let dir = TempDir::new().unwrap();
        let nfo = dir.path().join(EXTRAS_NFO_NAME);
        init_extras_nfo(&nfo).unwrap();
        append_extra_if_missing(&nfo, "A", "A.mp4").unwrap();
        init_extras_nfo(&nfo).unwrap();
        assert!(fs::read_to_string(&nfo).unwrap().contains("A.mp4"));
    }

    #[test]
    fn test_close_is_idempotent_and_reopens_for_later_discs() {
        let dir = TempDir::new().unwrap();
        let nfo = dir.path().join(EXTRAS_NFO_NAME);
        init_extras_nfo(&nfo).unwrap();
        close_extras_nfo(&nfo).unwrap();
        close_extras_nfo(&nfo).unwrap();

        append_extra_if_missing(&nfo, "Disc02_Extra", "Disc02_Extra.mp4").unwrap();
        close_extras_nfo(&nfo).unwrap();

        let content = fs::read_to_string(&nfo).unwrap();
        assert_eq!(content.matches(CLOSE_TAG).count(), 1);
        assert!(content.trim_end().ends_with(CLOSE_TAG));
        assert!(content.starts_with(OPEN_TAG));
    }

    #[test]
    fn test_close_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let nfo = dir.path().join(EXTRAS_NFO_NAME);
        close_extras_nfo(&nfo).unwrap();
        assert!(!nfo.exists());
    }
}
