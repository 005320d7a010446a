//! Operator interaction.
//!
//! The runner blocks on a human between discs: to insert media, to free
//! disk space, or to answer title questions in interactive mode.

use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{self, BufRead, Write};

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

/// Source of operator answers.
pub trait Operator: Send + Sync {
    /// Show `message` and block until the operator confirms.
    fn confirm(&self, message: &str) -> io::Result<()>;

    /// Ask a question and return the raw answer line.
    fn ask(&self, question: &str) -> io::Result<String>;
}

/// Reads answers from stdin. Prompts go through the log so they appear in
/// the run log and on the console alike.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinOperator;

impl StdinOperator {
    fn read_line(&self) -> io::Result<String> {
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stdin closed while waiting for operator input",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl Operator for StdinOperator {
    fn confirm(&self, message: &str) -> io::Result<()> {
        info!("{}", message);
        self.read_line().map(|_| ())
    }

    fn ask(&self, question: &str) -> io::Result<String> {
        let mut out = io::stdout().lock();
        write!(out, "{}", question)?;
        out.flush()?;
        drop(out);
        self.read_line()
    }
}

/// Ask until the answer is not blank.
pub fn ask_nonempty(op: &dyn Operator, question: &str) -> io::Result<String> {
    loop {
        let v = op.ask(question)?;
        if !v.trim().is_empty() {
            return Ok(v.trim().to_string());
        }
        warn!("Input cannot be empty. Try again.");
    }
}

/// Ask until the answer is a 4-digit year.
pub fn ask_year(op: &dyn Operator, question: &str) -> io::Result<String> {
    loop {
        let v = op.ask(question)?;
        let v = v.trim();
        if YEAR.is_match(v) {
            return Ok(v.to_string());
        }
        warn!("Year must be a 4-digit number. Try again.");
    }
}

/// Ask until the answer is `y` or `n`.
pub fn ask_yes_no(op: &dyn Operator, question: &str) -> io::Result<bool> {
    loop {
        match op.ask(question)?.trim().to_lowercase().as_str() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => warn!("Please answer y or n."),
        }
    }
}

/// Ask until the answer is a positive number.
pub fn ask_number(op: &dyn Operator, question: &str) -> io::Result<u32> {
    loop {
        let v = op.ask(question)?;
        match v.trim().parse::<u32>() {
            Ok(n) if n >= 1 => return Ok(n),
            _ => warn!("Please enter a number."),
        }
    }
}
