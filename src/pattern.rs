//! Domain patterns: literal text with `*` wildcards, matched against a page origin.
//!
//! A pattern is compiled once into an anchored, case-insensitive regular expression. Every
//! character other than `*` is literal, so `login.example.com` does not match
//! `loginXexample.com`, and `*` stands for zero or more characters of any kind.

use regex::{Regex, RegexBuilder};

const WILDCARD: char = '*';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern cannot be empty")]
    Empty,
    #[error("invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

impl From<PatternError> for crate::error::FillError {
    fn from(err: PatternError) -> Self {
        Self::new(crate::error::ErrorCode::InvalidPattern, err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    regex: Regex,
}

impl CompiledPattern {
    /// Pattern text as the user typed it.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(&candidate.to_lowercase())
    }
}

pub fn compile(pattern: &str) -> Result<CompiledPattern, PatternError> {
    if pattern.trim().is_empty() {
        return Err(PatternError::Empty);
    }

    // regex::escape turns `*` into `\*`; that escaped marker is the only thing we widen.
    let escaped = regex::escape(pattern);
    let body = escaped.replace(r"\*", ".*");
    let anchored = format!("^{}$", body);

    let regex = RegexBuilder::new(&anchored)
        .case_insensitive(true)
        .build()
        .map_err(|e| PatternError::Invalid {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

    Ok(CompiledPattern {
        source: pattern.to_string(),
        regex,
    })
}

pub fn matches(pattern: &CompiledPattern, candidate: &str) -> bool {
    pattern.matches(candidate)
}

/// True for patterns such as `*` or `**` that match every origin.
///
/// Compilation accepts them; the management surface uses this to refuse or warn.
pub fn is_wildcard_only(pattern: &str) -> bool {
    let trimmed = pattern.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c == WILDCARD)
}
