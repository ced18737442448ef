//! Glob-style key patterns.
//!
//! `*` matches any run of characters (including none) and `?` matches a
//! single character. Everything else matches literally.

use crate::error::{EmberError, EmberResult};
use regex::{Regex, RegexBuilder};
use tracing::debug;

/// Compiled size allowed for one pattern.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    Regex(Regex),
}

impl Pattern {
    /// Compile a glob. Fails with [`EmberError::InvalidOperation`] when the
    /// pattern is too large to compile.
    pub fn new(pattern: &str, case_insensitive: bool) -> EmberResult<Self> {
        let matcher = if pattern == "*" {
            Matcher::Any
        } else {
            let mut expr = String::with_capacity(pattern.len() + 8);
            expr.push('^');
            let mut literal = String::new();
            for ch in pattern.chars() {
                match ch {
                    '*' | '?' => {
                        expr.push_str(&regex::escape(&literal));
                        literal.clear();
                        expr.push_str(if ch == '*' { ".*" } else { "." });
                    }
                    _ => literal.push(ch),
                }
            }
            expr.push_str(&regex::escape(&literal));
            expr.push('$');

            let re = RegexBuilder::new(&expr)
                .case_insensitive(case_insensitive)
                .dot_matches_new_line(true)
                .size_limit(PATTERN_SIZE_LIMIT)
                .build()
                .map_err(|e| {
                    debug!(len = pattern.len(), error = %e, "key pattern rejected");
                    EmberError::InvalidOperation
                })?;
            Matcher::Regex(re)
        };

        Ok(Self {
            source: pattern.to_string(),
            matcher,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Regex(re) => re.is_match(key),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}
