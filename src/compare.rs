//! Per-file comparison: combine one file's base coverage, head coverage,
//! and diff into line-level records and an aggregate change summary.
//!
//! Both derived views come out of a single traversal pass — callers that
//! read `lines()` and `change_summary()` pay the walk once.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::Serialize;

use crate::diff::{DiffStats, FileDiff};
use crate::report::{LineState, ReportFile, ReportTotals};
use crate::traverse::{AlignedLine, Traverser};

/// Knobs governing comparison construction. Passed explicitly — never
/// process-wide state.
#[derive(Debug, Clone)]
pub struct ComparisonConfig {
    /// Files whose diffs exceed this many hunk lines get `lines()`
    /// suppressed in whole-comparison listings.
    pub max_diff_size: usize,
    /// Allow comparing against a pull request's previously-notified base.
    pub allow_pseudo_compare: bool,
    /// Allow retroactively shifting the base report by the pseudo-diff.
    pub allow_coverage_offsets: bool,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            max_diff_size: 170,
            allow_pseudo_compare: false,
            allow_coverage_offsets: false,
        }
    }
}

/// A base/head pair of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sides<T> {
    pub base: T,
    pub head: T,
}

/// One aligned line, annotated with both sides' coverage states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineComparison {
    pub number: Sides<Option<u32>>,
    pub coverage: Sides<Option<LineState>>,
    pub value: String,
    pub is_diff: bool,
    pub added: bool,
    pub removed: bool,
    /// Number of head-side sessions that exercised this line; None when the
    /// head line is absent or recorded no sessions.
    pub sessions: Option<usize>,
}

/// Signed hit/miss/partial deltas for coverage drift on lines the diff
/// itself didn't touch. Counters that net out to zero are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    deltas: BTreeMap<LineState, i64>,
}

impl ChangeSummary {
    /// Record one line's transition between coverage states.
    pub fn record(&mut self, from: LineState, to: LineState) {
        if from == to {
            return;
        }
        self.bump(from, -1);
        self.bump(to, 1);
    }

    fn bump(&mut self, state: LineState, delta: i64) {
        let counter = self.deltas.entry(state).or_insert(0);
        *counter += delta;
        if *counter == 0 {
            self.deltas.remove(&state);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    #[must_use]
    pub fn delta(&self, state: LineState) -> i64 {
        self.deltas.get(&state).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LineState, i64)> + '_ {
        self.deltas.iter().map(|(state, delta)| (*state, *delta))
    }
}

impl Serialize for ChangeSummary {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.deltas.len()))?;
        for (state, delta) in &self.deltas {
            map.serialize_entry(state.plural(), delta)?;
        }
        map.end()
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (state, delta) in &self.deltas {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{} {:+}", state.plural(), delta)?;
        }
        Ok(())
    }
}

fn state_at(file: Option<&ReportFile>, number: Option<u32>) -> Option<LineState> {
    let line = file?.line(number?)?;
    Some(line.coverage.state())
}

/// Builds [`LineComparison`]s from the aligned stream.
struct LineComparisonBuilder<'a> {
    base_file: Option<&'a ReportFile>,
    head_file: Option<&'a ReportFile>,
    lines: Vec<LineComparison>,
}

impl LineComparisonBuilder<'_> {
    fn visit(&mut self, aligned: &AlignedLine) {
        // No displayable text, nothing to show.
        let Some(value) = &aligned.value else {
            return;
        };

        let sessions = aligned
            .head_ln
            .and_then(|ln| self.head_file?.line(ln))
            .and_then(|line| {
                if line.sessions.is_empty() {
                    None
                } else {
                    Some(line.sessions.iter().filter(|s| s.hits > 0).count())
                }
            });

        self.lines.push(LineComparison {
            number: Sides {
                base: aligned.base_ln,
                head: aligned.head_ln,
            },
            coverage: Sides {
                base: state_at(self.base_file, aligned.base_ln),
                head: state_at(self.head_file, aligned.head_ln),
            },
            value: value.clone(),
            is_diff: aligned.is_diff,
            added: aligned.is_diff && aligned.base_ln.is_none(),
            removed: aligned.is_diff && aligned.head_ln.is_none(),
            sessions,
        });
    }
}

/// Accumulates the [`ChangeSummary`] from the aligned stream. Diff lines
/// are excluded — the diff itself already explains their coverage change.
struct ChangeSummaryBuilder<'a> {
    base_file: Option<&'a ReportFile>,
    head_file: Option<&'a ReportFile>,
    summary: ChangeSummary,
}

impl ChangeSummaryBuilder<'_> {
    fn visit(&mut self, aligned: &AlignedLine) {
        if aligned.is_diff {
            return;
        }
        let (Some(base_state), Some(head_state)) = (
            state_at(self.base_file, aligned.base_ln),
            state_at(self.head_file, aligned.head_ln),
        ) else {
            return;
        };
        self.summary.record(base_state, head_state);
    }
}

struct Traversal {
    lines: Vec<LineComparison>,
    summary: ChangeSummary,
    searched: bool,
}

/// Comparison of a single file pair. Constructed per request; the traversal
/// runs lazily, at most once.
pub struct FileComparison<'a> {
    base_name: Option<&'a str>,
    head_name: Option<&'a str>,
    base_file: Option<&'a ReportFile>,
    head_file: Option<&'a ReportFile>,
    diff: Option<&'a FileDiff>,
    src: Vec<String>,
    should_search_for_changes: Option<bool>,
    max_diff_size: usize,
    bypass_max_diff_size: bool,
    traversal: OnceCell<Traversal>,
}

impl<'a> FileComparison<'a> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: Option<(&'a str, &'a ReportFile)>,
        head: Option<(&'a str, &'a ReportFile)>,
        diff: Option<&'a FileDiff>,
        src: Vec<String>,
        should_search_for_changes: Option<bool>,
        config: &ComparisonConfig,
        bypass_max_diff_size: bool,
    ) -> Self {
        Self {
            base_name: base.map(|(name, _)| name),
            head_name: head.map(|(name, _)| name),
            base_file: base.map(|(_, file)| file),
            head_file: head.map(|(_, file)| file),
            diff,
            src,
            should_search_for_changes,
            max_diff_size: config.max_diff_size,
            bypass_max_diff_size,
            traversal: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> Sides<Option<&str>> {
        Sides {
            base: self.base_name,
            head: self.head_name,
        }
    }

    #[must_use]
    pub fn has_diff(&self) -> bool {
        self.diff.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> Option<DiffStats> {
        self.diff.map(|d| d.stats)
    }

    /// Per-side totals, plus the coverage of the diff's added lines in the
    /// head report when a diff is present.
    #[must_use]
    pub fn totals(&self) -> FileComparisonTotals {
        FileComparisonTotals {
            base: self.base_file.map(ReportFile::totals),
            head: self.head_file.map(ReportFile::totals),
            diff: self.diff.map(|diff| self.diff_totals(diff)),
        }
    }

    fn diff_totals(&self, diff: &FileDiff) -> ReportTotals {
        let mut totals = ReportTotals::default();
        if let Some(head_file) = self.head_file {
            for number in diff.added_lines() {
                let Some(line) = head_file.line(number) else {
                    continue;
                };
                totals.lines += 1;
                match line.coverage.state() {
                    LineState::Hit => totals.hits += 1,
                    LineState::Miss => totals.misses += 1,
                    LineState::Partial => totals.partials += 1,
                }
            }
        }
        totals.coverage = if totals.lines > 0 {
            Some(crate::report::rate(totals.hits, totals.lines) * 100.0)
        } else {
            None
        };
        totals
    }

    /// True when this file's diff is too large for line-by-line listing.
    #[must_use]
    pub fn is_oversized(&self) -> bool {
        self.diff
            .is_some_and(|d| d.segment_line_count() > self.max_diff_size)
    }

    /// The line-by-line comparison, or None when the diff is oversized and
    /// this isn't a single-file detail lookup.
    #[must_use]
    pub fn lines(&self) -> Option<&[LineComparison]> {
        if self.is_oversized() && !self.bypass_max_diff_size {
            return None;
        }
        Some(&self.compute().lines)
    }

    #[must_use]
    pub fn change_summary(&self) -> &ChangeSummary {
        &self.compute().summary
    }

    /// Whether the change-summary pass ran. Rule: run when changes are
    /// known to exist, or unknown while source text is available to scan.
    #[must_use]
    pub fn searched_for_changes(&self) -> bool {
        self.compute().searched
    }

    fn compute(&self) -> &Traversal {
        self.traversal.get_or_init(|| {
            let searched = self
                .should_search_for_changes
                .unwrap_or_else(|| !self.src.is_empty());

            let mut lines = LineComparisonBuilder {
                base_file: self.base_file,
                head_file: self.head_file,
                lines: Vec::new(),
            };
            let mut changes = ChangeSummaryBuilder {
                base_file: self.base_file,
                head_file: self.head_file,
                summary: ChangeSummary::default(),
            };

            let segments = self.diff.map(|d| d.segments.clone()).unwrap_or_default();
            let base_eof = self.base_file.map_or(0, ReportFile::eof);
            let head_eof = self.head_file.map_or(0, ReportFile::eof);
            for aligned in Traverser::new(base_eof, head_eof, segments, self.src.clone()) {
                lines.visit(&aligned);
                if searched {
                    changes.visit(&aligned);
                }
            }

            Traversal {
                lines: lines.lines,
                summary: changes.summary,
                searched,
            }
        })
    }
}

/// Totals for one file comparison: each side plus the diff sub-total.
#[derive(Debug, Clone, Serialize)]
pub struct FileComparisonTotals {
    pub base: Option<ReportTotals>,
    pub head: Option<ReportTotals>,
    pub diff: Option<ReportTotals>,
}
