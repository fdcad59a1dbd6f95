//! Branch pattern matching
//!
//! Patterns use `*` as a multi-character wildcard in a small set of positions:
//!
//! - `*` matches every branch, including names containing `/`
//! - `*suffix` matches branches ending with `suffix`
//! - `prefix*` matches branches starting with `prefix`
//! - `pre*suf` matches branches starting with `pre` and ending with `suf`
//!
//! Anything else, including patterns with more than one interior wildcard,
//! is compared literally against the branch name.

/// Branch used when a repository configures no patterns
pub const DEFAULT_BRANCH_PATTERN: &str = "main";

/// Check whether `branch` is selected by `pattern`
pub fn matches(branch: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return branch.ends_with(suffix);
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return branch.starts_with(prefix);
    }

    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if !suffix.contains('*') {
            // Independent checks; prefix and suffix may overlap on short names.
            return branch.starts_with(prefix) && branch.ends_with(suffix);
        }
    }

    branch == pattern
}

/// Whether a pattern is compared literally even though it contains `*`
///
/// Used by configuration validation to flag patterns the matcher does not
/// interpret as globs.
pub fn is_literal_fallback(pattern: &str) -> bool {
    if !pattern.contains('*') || pattern == "*" {
        return false;
    }
    if pattern.starts_with('*') || pattern.ends_with('*') {
        return false;
    }
    pattern.matches('*').count() > 1
}

/// The set of patterns configured for one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFilter {
    patterns: Vec<String>,
}

impl BranchFilter {
    /// Build a filter, falling back to [`DEFAULT_BRANCH_PATTERN`] when empty
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            patterns.push(DEFAULT_BRANCH_PATTERN.to_string());
        }
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True if any configured pattern selects `branch`
    pub fn is_match(&self, branch: &str) -> bool {
        self.patterns.iter().any(|pattern| matches(branch, pattern))
    }

    /// Filter remote branches, keeping discovery order
    pub fn select<'a, I>(&self, branches: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        branches
            .into_iter()
            .filter(|branch| self.is_match(branch))
            .map(str::to_string)
            .collect()
    }
}
