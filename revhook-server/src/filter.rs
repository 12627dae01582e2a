//! Branch ignore-lists.

use glob::Pattern;

/// A project's list of branches that never get reviewed.
///
/// Entries are globs (`release/*`). An entry that is not a valid glob is
/// compared literally.
#[derive(Debug, Clone, Default)]
pub struct BranchFilter {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
enum Entry {
    Glob(Pattern),
    Literal(String),
}

impl BranchFilter {
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split([',', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match Pattern::new(s) {
                Ok(pattern) => Entry::Glob(pattern),
                Err(_) => Entry::Literal(s.to_string()),
            })
            .collect();
        Self { entries }
    }

    /// Whether `branch` is on the ignore-list. `refs/heads/` is stripped first.
    pub fn ignores(&self, branch: &str) -> bool {
        let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        self.entries.iter().any(|entry| match entry {
            Entry::Glob(pattern) => pattern.matches(branch),
            Entry::Literal(literal) => literal == branch,
        })
    }
}
