//! Compiled glob patterns for file scopes and command rules.
//!
//! Path patterns keep `/` as a literal separator (`*` stays within one
//! segment, `**` crosses segments). Command patterns treat `/` as an ordinary
//! character so `git *` matches `git push origin/main`.

use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{RelayError, Result};

const GLOB_META: &[char] = &['*', '?', '[', '{', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternFlavor {
    Path,
    Command,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    matcher: GlobMatcher,
    specificity: usize,
}

impl Pattern {
    pub fn path(source: &str) -> Result<Self> {
        Self::compile(source, PatternFlavor::Path)
    }

    pub fn command(source: &str) -> Result<Self> {
        Self::compile(source, PatternFlavor::Command)
    }

    pub fn compile(source: &str, flavor: PatternFlavor) -> Result<Self> {
        let normalized = match flavor {
            PatternFlavor::Path => source.trim().trim_start_matches("./").to_string(),
            PatternFlavor::Command => normalize_command(source),
        };
        if normalized.is_empty() {
            return Err(RelayError::config("glob pattern cannot be empty"));
        }
        let glob = GlobBuilder::new(&normalized)
            .literal_separator(flavor == PatternFlavor::Path)
            .backslash_escape(true)
            .build()
            .map_err(|e| RelayError::config(format!("malformed glob '{source}': {e}")))?;
        Ok(Self {
            specificity: literal_prefix_len(&normalized),
            source: normalized,
            matcher: glob.compile_matcher(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Length of the fixed prefix before the first glob metacharacter.
    /// A longer prefix means a more specific rule.
    pub fn specificity(&self) -> usize {
        self.specificity
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.matcher.is_match(candidate)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

fn literal_prefix_len(pattern: &str) -> usize {
    pattern
        .char_indices()
        .find(|(_, c)| GLOB_META.contains(c))
        .map(|(i, _)| i)
        .unwrap_or(pattern.len())
}

/// Collapse runs of whitespace so `cargo   test` and `cargo test` match the
/// same rules.
pub fn normalize_command(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a workspace-relative path for matching.
///
/// Strips `./` prefixes and empty segments. Returns `None` for absolute paths
/// and for any `..` segment, since either can name a file outside the
/// workspace.
pub fn normalize_path(path: &str) -> Option<String> {
    if path.starts_with('/') || path.starts_with('\\') || Path::new(path).is_absolute() {
        return None;
    }
    let mut segments = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return None,
            s => segments.push(s),
        }
    }
    Some(segments.join("/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
