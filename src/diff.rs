//! Unified-diff model and parser.
//!
//! A parsed diff keeps whole hunks (headers plus every line), not just added
//! line numbers — the comparison engine walks hunks line-by-line alongside
//! two coverage reports. Diff lines are a tagged enum rather than raw
//! prefixed strings, so downstream code never sniffs `+`/`-` prefixes.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CovcmpError, Result};

/// Pre-compiled regex for hunk headers like "@@ -10,5 +20,8 @@".
static HUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

/// One line of a diff hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffLine {
    Added(String),
    Removed(String),
    Context(String),
}

impl DiffLine {
    /// Parse a raw hunk line. Context lines may carry the conventional
    /// leading space or be bare.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix('+') {
            DiffLine::Added(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix('-') {
            DiffLine::Removed(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix(' ') {
            DiffLine::Context(rest.to_string())
        } else {
            DiffLine::Context(raw.to_string())
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            DiffLine::Added(text) | DiffLine::Removed(text) | DiffLine::Context(text) => text,
        }
    }
}

/// A hunk header: `(base_start, base_len, head_start, head_len)`.
///
/// A length of `None` is the unified-diff shorthand for exactly 1 — it
/// encodes single-line hunks at a file's start or end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub base_start: u32,
    pub base_len: Option<u32>,
    pub head_start: u32,
    pub head_len: Option<u32>,
}

impl SegmentHeader {
    #[must_use]
    pub fn new(base_start: u32, base_len: Option<u32>, head_start: u32, head_len: Option<u32>) -> Self {
        Self {
            base_start,
            base_len,
            head_start,
            head_len,
        }
    }

    /// Parse the string-encoded header fields `[base_start, base_len,
    /// head_start, head_len]`. Empty fields mean 1; anything non-numeric
    /// is rejected.
    pub fn from_fields(fields: [&str; 4]) -> Result<Self> {
        fn field(raw: &str) -> Result<Option<u32>> {
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse().map(Some).map_err(|_| {
                CovcmpError::InvalidDiffFormat(format!("non-numeric header field: '{raw}'"))
            })
        }
        Ok(Self {
            base_start: field(fields[0])?.unwrap_or(1),
            base_len: field(fields[1])?,
            head_start: field(fields[2])?.unwrap_or(1),
            head_len: field(fields[3])?,
        })
    }

    #[must_use]
    pub fn base_len(&self) -> u32 {
        self.base_len.unwrap_or(1)
    }

    #[must_use]
    pub fn head_len(&self) -> u32 {
        self.head_len.unwrap_or(1)
    }

    /// Half-open range of base line numbers this hunk covers. Saturates so
    /// absurd line numbers in a crafted header cannot overflow.
    #[must_use]
    pub fn base_range(&self) -> Range<u32> {
        self.base_start..self.base_start.saturating_add(self.base_len())
    }

    /// Half-open range of head line numbers this hunk covers.
    #[must_use]
    pub fn head_range(&self) -> Range<u32> {
        self.head_start..self.head_start.saturating_add(self.head_len())
    }
}

/// One hunk of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSegment {
    pub header: SegmentHeader,
    pub lines: Vec<DiffLine>,
}

/// How a file changed between the two commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    New,
    Modified,
    Renamed,
    Deleted,
}

/// Added/removed line counts for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: u32,
    pub removed: u32,
}

/// The diff of a single file: its hunks plus change metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub change_type: ChangeType,
    /// Previous path, for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    pub stats: DiffStats,
    pub segments: Vec<DiffSegment>,
}

impl FileDiff {
    /// Total number of hunk lines across all segments. Oversized diffs get
    /// their line-by-line rendering suppressed.
    #[must_use]
    pub fn segment_line_count(&self) -> usize {
        self.segments.iter().map(|s| s.lines.len()).sum()
    }

    /// Head-side line numbers of every added line.
    #[must_use]
    pub fn added_lines(&self) -> Vec<u32> {
        let mut added = Vec::new();
        for segment in &self.segments {
            let mut head_ln = segment.header.head_start;
            for line in &segment.lines {
                match line {
                    DiffLine::Added(_) => {
                        added.push(head_ln);
                        head_ln += 1;
                    }
                    DiffLine::Removed(_) => {}
                    DiffLine::Context(_) => head_ln += 1,
                }
            }
        }
        added
    }
}

/// The diff between two commits, keyed by (head-side) file path. Deleted
/// files are keyed by their old path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDiff {
    pub files: BTreeMap<String, FileDiff>,
}

impl CommitDiff {
    /// A diff touching a single modified file, with no recorded stats.
    /// Convenient for building diffs programmatically.
    #[must_use]
    pub fn single(path: &str, segments: Vec<DiffSegment>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(
            path.to_string(),
            FileDiff {
                change_type: ChangeType::Modified,
                before: None,
                stats: DiffStats::default(),
                segments,
            },
        );
        Self { files }
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.get(path)
    }
}

/// Strip common VCS prefixes: "b/" (default git), "a/" (some tools).
/// Also handles --no-prefix diffs where no prefix is present.
fn strip_vcs_prefix(path: &str) -> &str {
    path.strip_prefix("b/")
        .or_else(|| path.strip_prefix("a/"))
        .unwrap_or(path)
}

/// Accumulates one file's diff while scanning.
#[derive(Default)]
struct PendingFile {
    path: Option<String>,
    old_path: Option<String>,
    renamed: bool,
    new_file: bool,
    deleted: bool,
    stats: DiffStats,
    segments: Vec<DiffSegment>,
}

impl PendingFile {
    fn finish(self, files: &mut BTreeMap<String, FileDiff>) {
        let change_type = if self.deleted {
            ChangeType::Deleted
        } else if self.renamed {
            ChangeType::Renamed
        } else if self.new_file {
            ChangeType::New
        } else {
            ChangeType::Modified
        };
        // Deleted files only have an old path.
        let Some(path) = self.path.or_else(|| self.old_path.clone()) else {
            return;
        };
        if self.segments.is_empty() && !self.deleted && !self.new_file && !self.renamed {
            return;
        }
        let before = if self.renamed { self.old_path } else { None };
        files.insert(
            path,
            FileDiff {
                change_type,
                before,
                stats: self.stats,
                segments: self.segments,
            },
        );
    }
}

/// Parse a unified diff (e.g., `git diff base head`) into a [`CommitDiff`].
///
/// Hunk headers that are present but malformed fail fast with
/// [`CovcmpError::InvalidDiffFormat`]; the parser never panics.
pub fn parse_diff(diff_text: &str) -> Result<CommitDiff> {
    let mut files = BTreeMap::new();
    let mut current: Option<PendingFile> = None;

    for line in diff_text.lines() {
        if line.starts_with("diff --git ") {
            if let Some(pending) = current.take() {
                pending.finish(&mut files);
            }
            current = Some(PendingFile::default());
            continue;
        }

        let Some(pending) = current.as_mut() else {
            // Diff fragments without a "diff --git" preamble (e.g. plain
            // `diff -u` output) still carry ---/+++ headers.
            if line.starts_with("--- ") || line.starts_with("+++ ") {
                current = Some(PendingFile::default());
            } else {
                continue;
            }
            // Reprocess this line against the fresh pending file.
            if let Some(pending) = current.as_mut() {
                pending.consume(line)?;
            }
            continue;
        };

        pending.consume(line)?;
    }

    if let Some(pending) = current.take() {
        pending.finish(&mut files);
    }

    Ok(CommitDiff { files })
}

impl PendingFile {
    fn consume(&mut self, line: &str) -> Result<()> {
        if let Some(rest) = line.strip_prefix("rename from ") {
            self.old_path = Some(rest.to_string());
            self.renamed = true;
        } else if let Some(rest) = line.strip_prefix("rename to ") {
            self.path = Some(rest.to_string());
        } else if line.starts_with("new file mode") {
            self.new_file = true;
        } else if line.starts_with("deleted file mode") {
            self.deleted = true;
        } else if let Some(rest) = line.strip_prefix("--- ") {
            if rest == "/dev/null" {
                self.new_file = true;
            } else {
                self.old_path = Some(strip_vcs_prefix(rest).to_string());
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if rest == "/dev/null" {
                self.deleted = true;
                self.path = None;
            } else {
                self.path = Some(strip_vcs_prefix(rest).to_string());
            }
        } else if line.starts_with("@@ ") {
            let captures = HUNK_RE.captures(line).ok_or_else(|| {
                CovcmpError::InvalidDiffFormat(format!("bad hunk header: '{line}'"))
            })?;
            // The regex only matches digit runs; overflow is the one way a
            // capture can fail to parse.
            let num = |i: usize| -> Result<Option<u32>> {
                captures
                    .get(i)
                    .map(|m| {
                        m.as_str().parse().map_err(|_| {
                            CovcmpError::InvalidDiffFormat(format!("header field overflow: '{line}'"))
                        })
                    })
                    .transpose()
            };
            self.segments.push(DiffSegment {
                header: SegmentHeader {
                    base_start: num(1)?.unwrap_or(1),
                    base_len: num(2)?,
                    head_start: num(3)?.unwrap_or(1),
                    head_len: num(4)?,
                },
                lines: Vec::new(),
            });
        } else if line.starts_with('\\') {
            // "\ No newline at end of file" — diff metadata, not a real line
        } else if let Some(segment) = self.segments.last_mut() {
            let diff_line = DiffLine::parse(line);
            match diff_line {
                DiffLine::Added(_) => self.stats.added += 1,
                DiffLine::Removed(_) => self.stats.removed += 1,
                DiffLine::Context(_) => {}
            }
            segment.lines.push(diff_line);
        }
        Ok(())
    }
}
