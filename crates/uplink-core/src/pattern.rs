//! Glob patterns over dotted identifiers.
//!
//! `*` alone matches everything. Otherwise `*` matches any run of
//! characters; a pattern that does not start with `*` is anchored at the
//! start, one that does not end with `*` is anchored at the end. All other
//! characters are literal.

use crate::error::{UplinkError, UplinkResult};
use regex::Regex;

/// Separator between object id and file-name pattern in composite
/// file-subscription keys.
pub const FILE_KEY_SEP: &str = "####";

/// Build the composite registry key for a file subscription.
pub fn file_key(object_id: &str, file_pattern: &str) -> String {
    format!("{object_id}{FILE_KEY_SEP}{file_pattern}")
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: String,
    regex: Regex,
}

impl Matcher {
    /// Compile a glob pattern. Empty patterns are rejected.
    pub fn compile(pattern: &str) -> UplinkResult<Self> {
        if pattern.is_empty() {
            return Err(UplinkError::Validation("empty pattern".into()));
        }

        let source = if pattern == "*" {
            ".*".to_string()
        } else {
            let body = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let start = if pattern.starts_with('*') { "" } else { "^" };
            let end = if pattern.ends_with('*') { "" } else { "$" };
            format!("{start}{body}{end}")
        };

        let regex = Regex::new(&source)
            .map_err(|e| UplinkError::Validation(format!("bad pattern {pattern:?}: {e}")))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The original pattern text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Test an identifier against the pattern.
    pub fn matches(&self, id: &str) -> bool {
        self.regex.is_match(id)
    }
}
