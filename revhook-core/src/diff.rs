//! Unified-diff handling: split into per-file sections, filter, and chunk.
//!
//! Diffs arrive in `git diff` format. Platforms that return per-file diffs
//! without headers have them synthesised by the server before they get here,
//! so every file section starts with a `diff --git` line.

use glob::{MatchOptions, Pattern, PatternError};

use crate::job::ChangeStats;

/// One file's section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Path after the change (or before it, for deletions).
    pub path: String,
    pub deleted: bool,
    /// The full section text, header included, newline-terminated.
    pub text: String,
    pub additions: u32,
    pub deletions: u32,
}

/// Split a unified diff into per-file sections.
///
/// Text before the first `diff --git` header is discarded.
pub fn split_files(diff: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            if let Some(lines) = current.take() {
                files.push(parse_section(&lines));
            }
            current = Some(vec![line]);
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some(lines) = current {
        files.push(parse_section(&lines));
    }

    files
}

fn parse_section(lines: &[&str]) -> FileDiff {
    let header_path = lines
        .first()
        .and_then(|header| header.rsplit_once(" b/"))
        .map(|(_, path)| path.to_string())
        .unwrap_or_default();

    let mut old_path = None;
    let mut new_path = None;
    let mut additions = 0u32;
    let mut deletions = 0u32;
    let mut in_hunk = false;

    for line in &lines[1..] {
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            if let Some(path) = line.strip_prefix("--- ") {
                old_path = Some(strip_side_prefix(path, "a/"));
            } else if let Some(path) = line.strip_prefix("+++ ") {
                new_path = Some(strip_side_prefix(path, "b/"));
            }
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }

    let deleted = new_path.as_deref() == Some("/dev/null");
    let path = match (new_path, old_path) {
        (Some(new), _) if new != "/dev/null" => new,
        (_, Some(old)) if old != "/dev/null" => old,
        _ => header_path,
    };

    let mut text = lines.join("\n");
    text.push('\n');

    FileDiff {
        path,
        deleted,
        text,
        additions,
        deletions,
    }
}

fn strip_side_prefix(path: &str, prefix: &str) -> String {
    let path = path.split('\t').next().unwrap_or(path);
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

/// Per-project rules deciding which files are worth reviewing.
#[derive(Debug, Clone, Default)]
pub struct DiffFilter {
    /// Lower-cased extensions with a leading dot. Empty means "all".
    extensions: Vec<String>,
    ignore: Vec<Pattern>,
}

/// The part of a diff that survived filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredDiff {
    pub files: Vec<FileDiff>,
    pub stats: ChangeStats,
}

impl FilteredDiff {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}

const IGNORE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl DiffFilter {
    /// Build a filter from a project's extension allow-list and ignore globs.
    ///
    /// Extensions may be given with or without the leading dot (`go`, `.go`).
    pub fn new(extensions: &[String], ignore_patterns: &[String]) -> Result<Self, PatternError> {
        let extensions = extensions
            .iter()
            .map(|ext| ext.trim())
            .filter(|ext| !ext.is_empty())
            .map(|ext| {
                let ext = ext.to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();
        let ignore = ignore_patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(Pattern::new)
            .collect::<Result<_, _>>()?;

        Ok(Self { extensions, ignore })
    }

    pub fn allows(&self, path: &str) -> bool {
        if self.ignore.iter().any(|p| p.matches_with(path, IGNORE_MATCH)) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        let file_name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
        self.extensions.iter().any(|ext| file_name.ends_with(ext))
    }

    /// Keep the file sections this filter allows, dropping deletions.
    ///
    /// Deleted files carry nothing to review.
    pub fn apply(&self, diff: &str) -> FilteredDiff {
        let files: Vec<FileDiff> = split_files(diff)
            .into_iter()
            .filter(|f| !f.deleted && self.allows(&f.path))
            .collect();

        let stats = ChangeStats {
            files_changed: files.len() as u32,
            additions: files.iter().map(|f| f.additions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
        };

        FilteredDiff { files, stats }
    }
}

/// A piece of a diff small enough for one engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffChunk {
    pub text: String,
    /// Changed lines in the chunk, used to weight its score.
    pub changed_lines: u32,
}

/// Pack file sections into chunks of at most `max_chars`.
///
/// Files are never split unless a single file alone exceeds the limit, in
/// which case it is split on hunk boundaries. A single hunk larger than the
/// limit becomes its own oversized chunk rather than being cut mid-hunk.
pub fn chunk_files(files: &[FileDiff], max_chars: usize) -> Vec<DiffChunk> {
    let mut chunks = Vec::new();
    let mut text = String::new();
    let mut changed = 0u32;

    let mut flush = |text: &mut String, changed: &mut u32, chunks: &mut Vec<DiffChunk>| {
        if !text.is_empty() {
            chunks.push(DiffChunk {
                text: std::mem::take(text),
                changed_lines: *changed,
            });
            *changed = 0;
        }
    };

    for file in files {
        let file_changed = file.additions + file.deletions;
        if file.text.len() > max_chars {
            flush(&mut text, &mut changed, &mut chunks);
            chunks.extend(split_by_hunk(file, max_chars));
            continue;
        }
        if text.len() + file.text.len() > max_chars {
            flush(&mut text, &mut changed, &mut chunks);
        }
        text.push_str(&file.text);
        changed += file_changed;
    }
    flush(&mut text, &mut changed, &mut chunks);

    chunks
}

fn split_by_hunk(file: &FileDiff, max_chars: usize) -> Vec<DiffChunk> {
    let mut header = String::new();
    let mut hunks: Vec<String> = Vec::new();

    for line in file.text.lines() {
        if line.starts_with("@@") {
            hunks.push(String::new());
        }
        let target = match hunks.last_mut() {
            Some(hunk) => hunk,
            None => &mut header,
        };
        target.push_str(line);
        target.push('\n');
    }

    let mut chunks = Vec::new();
    let mut text = header.clone();
    let mut has_hunk = false;
    for hunk in hunks {
        if has_hunk && text.len() + hunk.len() > max_chars {
            chunks.push(finish_chunk(std::mem::replace(&mut text, header.clone())));
            has_hunk = false;
        }
        text.push_str(&hunk);
        has_hunk = true;
    }
    if has_hunk {
        chunks.push(finish_chunk(text));
    }
    chunks
}

fn finish_chunk(text: String) -> DiffChunk {
    let changed_lines = text
        .lines()
        .filter(|l| {
            (l.starts_with('+') && !l.starts_with("+++"))
                || (l.starts_with('-') && !l.starts_with("---"))
        })
        .count() as u32;
    DiffChunk {
        text,
        changed_lines,
    }
}
