//! Line-alignment traversal: walk a unified diff hunk-by-hunk alongside two
//! coverage-line sequences, yielding one [`AlignedLine`] per logical line
//! pair. Added lines advance only the head cursor, removed lines only the
//! base cursor, everything else advances both.
//!
//! The walk is an explicit iterator over immutable values; callers that
//! need several derived views (line comparisons, change summaries) drive a
//! single pass and feed each item to every consumer.

use crate::diff::{DiffLine, DiffSegment};

/// One aligned position across the base file, head file, and diff.
///
/// At least one of `base_ln`/`head_ln` is always set: a `None` side means
/// the line does not exist there (added/removed by the diff, or past that
/// file's EOF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedLine {
    pub base_ln: Option<u32>,
    pub head_ln: Option<u32>,
    /// Raw line text, when the diff or the supplied source provides it.
    pub value: Option<String>,
    /// True when this position came from inside a diff hunk.
    pub is_diff: bool,
}

/// Iterator state for one file pair's walk.
///
/// `base_file_eof`/`head_file_eof` are the highest line numbers the
/// respective coverage reports track. A hunk may extend past them —
/// coverage tools count certain multi-line expressions as one line while
/// diffs count them all — so termination waits for the current hunk to
/// drain.
pub struct Traverser {
    base_ln: u32,
    head_ln: u32,
    base_file_eof: u32,
    head_file_eof: u32,
    segments: Vec<DiffSegment>,
    segment_idx: usize,
    line_idx: usize,
    src: Vec<String>,
}

impl Traverser {
    #[must_use]
    pub fn new(
        base_file_eof: u32,
        head_file_eof: u32,
        segments: Vec<DiffSegment>,
        src: Vec<String>,
    ) -> Self {
        Self {
            base_ln: 1,
            head_ln: 1,
            base_file_eof,
            head_file_eof,
            segments,
            segment_idx: 0,
            line_idx: 0,
            src,
        }
    }

    /// Drop fully-consumed (or empty) hunks so the current hunk always has
    /// at least one line left.
    fn skip_exhausted_segments(&mut self) {
        while let Some(segment) = self.segments.get(self.segment_idx) {
            if self.line_idx < segment.lines.len() {
                break;
            }
            self.segment_idx += 1;
            self.line_idx = 0;
        }
    }

    /// True when either cursor falls within the current hunk's header range.
    fn traversing_diff(&self) -> bool {
        let Some(segment) = self.segments.get(self.segment_idx) else {
            return false;
        };
        segment.header.base_range().contains(&self.base_ln)
            || segment.header.head_range().contains(&self.head_ln)
    }

    fn finished(&self) -> bool {
        !self.traversing_diff()
            && self.base_ln > self.base_file_eof
            && self.head_ln > self.head_file_eof
    }
}

impl Iterator for Traverser {
    type Item = AlignedLine;

    fn next(&mut self) -> Option<AlignedLine> {
        self.skip_exhausted_segments();
        if self.finished() {
            return None;
        }

        if self.traversing_diff() {
            let line = self.segments[self.segment_idx].lines[self.line_idx].clone();
            self.line_idx += 1;
            return Some(match line {
                DiffLine::Added(text) => {
                    let aligned = AlignedLine {
                        base_ln: None,
                        head_ln: Some(self.head_ln),
                        value: Some(text),
                        is_diff: true,
                    };
                    self.head_ln = self.head_ln.saturating_add(1);
                    aligned
                }
                DiffLine::Removed(text) => {
                    let aligned = AlignedLine {
                        base_ln: Some(self.base_ln),
                        head_ln: None,
                        value: Some(text),
                        is_diff: true,
                    };
                    self.base_ln = self.base_ln.saturating_add(1);
                    aligned
                }
                DiffLine::Context(text) => {
                    let aligned = AlignedLine {
                        base_ln: Some(self.base_ln),
                        head_ln: Some(self.head_ln),
                        value: Some(text),
                        is_diff: true,
                    };
                    self.base_ln = self.base_ln.saturating_add(1);
                    self.head_ln = self.head_ln.saturating_add(1);
                    aligned
                }
            });
        }

        // Outside any hunk: a plain source line. A side past its EOF has no
        // such line and reports None.
        let aligned = AlignedLine {
            base_ln: (self.base_ln <= self.base_file_eof).then_some(self.base_ln),
            head_ln: (self.head_ln <= self.head_file_eof).then_some(self.head_ln),
            value: self.src.get(self.head_ln as usize - 1).cloned(),
            is_diff: false,
        };
        self.base_ln = self.base_ln.saturating_add(1);
        self.head_ln = self.head_ln.saturating_add(1);
        Some(aligned)
    }
}
