//! In-memory representation of a commit's coverage report, independent of
//! where it came from. Reports are stored as JSON blobs in the SQLite store
//! and are immutable once built — the one exception is pseudo-diff line
//! shifting, which re-aligns a stale base report before comparison.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::diff::{ChangeType, CommitDiff, DiffSegment};

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// Three-state classification of a single line's coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineState {
    Hit,
    Miss,
    Partial,
}

impl LineState {
    /// Pluralized name, as used in change summaries ("hits: +2").
    #[must_use]
    pub fn plural(&self) -> &'static str {
        match self {
            LineState::Hit => "hits",
            LineState::Miss => "misses",
            LineState::Partial => "partials",
        }
    }
}

impl std::fmt::Display for LineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineState::Hit => f.write_str("hit"),
            LineState::Miss => f.write_str("miss"),
            LineState::Partial => f.write_str("partial"),
        }
    }
}

/// The recorded coverage of a line: a plain hit count, or a branch fraction
/// like `1/2`. Serialized as a JSON number or a `"covered/total"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCoverage", into = "RawCoverage")]
pub enum CoverageValue {
    Hit(u64),
    Partial(u32, u32),
}

impl CoverageValue {
    /// Classify this value. Any fraction is a partial, regardless of how
    /// many of its branches were taken; a zero hit count is a miss.
    #[must_use]
    pub fn state(&self) -> LineState {
        match self {
            CoverageValue::Hit(0) => LineState::Miss,
            CoverageValue::Hit(_) => LineState::Hit,
            CoverageValue::Partial(_, _) => LineState::Partial,
        }
    }
}

impl std::fmt::Display for CoverageValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoverageValue::Hit(n) => write!(f, "{n}"),
            CoverageValue::Partial(c, t) => write!(f, "{c}/{t}"),
        }
    }
}

/// Wire form of [`CoverageValue`].
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCoverage {
    Count(u64),
    Fraction(String),
}

impl TryFrom<RawCoverage> for CoverageValue {
    type Error = String;

    fn try_from(raw: RawCoverage) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawCoverage::Count(n) => Ok(CoverageValue::Hit(n)),
            RawCoverage::Fraction(s) => {
                let (covered, total) = s
                    .split_once('/')
                    .ok_or_else(|| format!("not a coverage fraction: '{s}'"))?;
                let covered = covered
                    .parse()
                    .map_err(|_| format!("bad fraction numerator: '{s}'"))?;
                let total = total
                    .parse()
                    .map_err(|_| format!("bad fraction denominator: '{s}'"))?;
                Ok(CoverageValue::Partial(covered, total))
            }
        }
    }
}

impl From<CoverageValue> for RawCoverage {
    fn from(value: CoverageValue) -> Self {
        match value {
            CoverageValue::Hit(n) => RawCoverage::Count(n),
            CoverageValue::Partial(c, t) => RawCoverage::Fraction(format!("{c}/{t}")),
        }
    }
}

/// One upload's contribution to a line. A line may be exercised by any
/// number of test sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSession {
    pub id: u32,
    pub hits: u64,
}

/// A single instrumented line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLine {
    pub coverage: CoverageValue,
    /// Optional type tag: `"b"` for branch lines, `"m"` for method lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<LineSession>,
}

impl ReportLine {
    #[must_use]
    pub fn new(coverage: CoverageValue) -> Self {
        Self {
            coverage,
            line_type: None,
            sessions: Vec::new(),
        }
    }
}

/// Aggregate counters for a file or a whole report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportTotals {
    pub files: u64,
    pub lines: u64,
    pub hits: u64,
    pub misses: u64,
    pub partials: u64,
    pub branches: u64,
    pub methods: u64,
    pub sessions: u64,
    /// Line coverage percentage, absent when nothing is instrumented.
    pub coverage: Option<f64>,
}

impl ReportTotals {
    fn finish(mut self) -> Self {
        self.coverage = if self.lines > 0 {
            Some(rate(self.hits, self.lines) * 100.0)
        } else {
            None
        };
        self
    }
}

/// Coverage for a single source file: a sparse map of 1-based line numbers
/// to [`ReportLine`]s. Gaps are lines the instrumentation didn't track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFile {
    #[serde(default)]
    pub lines: BTreeMap<u32, ReportLine>,
}

impl ReportFile {
    #[must_use]
    pub fn line(&self, number: u32) -> Option<&ReportLine> {
        self.lines.get(&number)
    }

    /// Highest tracked line number, or 0 for an empty file. Coverage tools
    /// collapse some multi-line expressions into one line, so this may be
    /// smaller than the file's real length.
    #[must_use]
    pub fn eof(&self) -> u32 {
        self.lines.keys().next_back().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn totals(&self) -> ReportTotals {
        let mut totals = ReportTotals {
            files: 1,
            ..Default::default()
        };
        let mut session_ids = BTreeSet::new();
        for line in self.lines.values() {
            totals.lines += 1;
            match line.coverage.state() {
                LineState::Hit => totals.hits += 1,
                LineState::Miss => totals.misses += 1,
                LineState::Partial => totals.partials += 1,
            }
            match line.line_type.as_deref() {
                Some("b") => totals.branches += 1,
                Some("m") => totals.methods += 1,
                _ => {}
            }
            for session in &line.sessions {
                session_ids.insert(session.id);
            }
        }
        totals.sessions = session_ids.len() as u64;
        totals.finish()
    }

    /// Re-number tracked lines according to a diff applied on top of this
    /// file. Lines the diff touched are dropped; lines after a hunk shift
    /// by the hunk's net length delta.
    pub fn shift_lines_by_diff(&mut self, segments: &[DiffSegment]) {
        let old = std::mem::take(&mut self.lines);
        'line: for (number, line) in old {
            let mut offset: i64 = 0;
            for segment in segments {
                let base = segment.header.base_range();
                if base.contains(&number) {
                    continue 'line;
                }
                if base.end <= number {
                    offset += i64::from(segment.header.head_len())
                        - i64::from(segment.header.base_len());
                }
            }
            let shifted = i64::from(number) + offset;
            if shifted >= 1 {
                self.lines.insert(shifted as u32, line);
            }
        }
    }
}

/// A commit's full coverage report: one [`ReportFile`] per tracked path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default)]
    pub files: BTreeMap<String, ReportFile>,
}

impl CoverageReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn file(&self, name: &str) -> Option<&ReportFile> {
        self.files.get(name)
    }

    #[must_use]
    pub fn totals(&self) -> ReportTotals {
        let mut totals = ReportTotals::default();
        let mut session_ids = BTreeSet::new();
        for file in self.files.values() {
            let file_totals = file.totals();
            totals.files += 1;
            totals.lines += file_totals.lines;
            totals.hits += file_totals.hits;
            totals.misses += file_totals.misses;
            totals.partials += file_totals.partials;
            totals.branches += file_totals.branches;
            totals.methods += file_totals.methods;
            for line in file.lines.values() {
                for session in &line.sessions {
                    session_ids.insert(session.id);
                }
            }
        }
        totals.sessions = session_ids.len() as u64;
        totals.finish()
    }

    /// True when applying `diff` on top of this report would move (or drop)
    /// any tracked line number. Used to decide whether a pseudo-diff
    /// actually requires re-aligning the base report.
    #[must_use]
    pub fn diff_adjusts_tracked_lines(&self, diff: &CommitDiff) -> bool {
        for (path, file_diff) in &diff.files {
            let old_name = file_diff.before.as_deref().unwrap_or(path);
            let Some(file) = self.files.get(old_name) else {
                continue;
            };
            if file.lines.is_empty() {
                continue;
            }
            if file_diff.before.is_some() || file_diff.change_type == ChangeType::Deleted {
                return true;
            }
            let eof = file.eof();
            for segment in &file_diff.segments {
                if segment.header.head_len() != segment.header.base_len()
                    && segment.header.base_start <= eof
                {
                    return true;
                }
            }
        }
        false
    }

    /// Apply a diff's line re-numbering to every file it touches, renaming
    /// and deleting files as the diff dictates. Mutates the report in place
    /// for the remainder of the request.
    pub fn shift_lines_by_diff(&mut self, diff: &CommitDiff) {
        for (path, file_diff) in &diff.files {
            if file_diff.change_type == ChangeType::Deleted {
                self.files.remove(path);
                continue;
            }
            let old_name = file_diff.before.as_deref().unwrap_or(path);
            if let Some(mut file) = self.files.remove(old_name) {
                file.shift_lines_by_diff(&file_diff.segments);
                self.files.insert(path.clone(), file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::SegmentHeader;

    fn file_with(lines: &[(u32, CoverageValue)]) -> ReportFile {
        let mut file = ReportFile::default();
        for &(number, coverage) in lines {
            file.lines.insert(number, ReportLine::new(coverage));
        }
        file
    }

    // -- Classification -----------------------------------------------------

    #[test]
    fn test_state_classification() {
        assert_eq!(CoverageValue::Hit(1).state(), LineState::Hit);
        assert_eq!(CoverageValue::Hit(3).state(), LineState::Hit);
        assert_eq!(CoverageValue::Hit(0).state(), LineState::Miss);
        assert_eq!(CoverageValue::Partial(1, 2).state(), LineState::Partial);
    }

    #[test]
    fn test_state_classification_is_idempotent() {
        let value = CoverageValue::Partial(1, 2);
        assert_eq!(value.state(), value.state());
        assert_eq!(value.state(), LineState::Partial);
    }

    // -- Serde --------------------------------------------------------------

    #[test]
    fn test_coverage_value_roundtrip() {
        let hit: CoverageValue = serde_json::from_str("3").unwrap();
        assert_eq!(hit, CoverageValue::Hit(3));
        assert_eq!(serde_json::to_string(&hit).unwrap(), "3");

        let partial: CoverageValue = serde_json::from_str("\"1/2\"").unwrap();
        assert_eq!(partial, CoverageValue::Partial(1, 2));
        assert_eq!(serde_json::to_string(&partial).unwrap(), "\"1/2\"");
    }

    #[test]
    fn test_coverage_value_rejects_garbage() {
        assert!(serde_json::from_str::<CoverageValue>("\"half\"").is_err());
        assert!(serde_json::from_str::<CoverageValue>("\"1/x\"").is_err());
    }

    #[test]
    fn test_report_roundtrip() {
        let mut report = CoverageReport::new();
        let mut file = file_with(&[(1, CoverageValue::Hit(2)), (3, CoverageValue::Partial(1, 2))]);
        file.lines.get_mut(&1).unwrap().sessions = vec![LineSession { id: 0, hits: 2 }];
        report.files.insert("src/main.rs".to_string(), file);

        let json = serde_json::to_string(&report).unwrap();
        let back: CoverageReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    // -- Totals -------------------------------------------------------------

    #[test]
    fn test_file_totals() {
        let mut file = file_with(&[
            (1, CoverageValue::Hit(1)),
            (2, CoverageValue::Hit(0)),
            (4, CoverageValue::Partial(1, 2)),
        ]);
        file.lines.get_mut(&4).unwrap().line_type = Some("b".to_string());

        let totals = file.totals();
        assert_eq!(totals.lines, 3);
        assert_eq!(totals.hits, 1);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.partials, 1);
        assert_eq!(totals.branches, 1);
        assert!((totals.coverage.unwrap() - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_empty_file_totals_have_no_coverage() {
        assert_eq!(ReportFile::default().totals().coverage, None);
    }

    #[test]
    fn test_eof_is_highest_tracked_line() {
        assert_eq!(ReportFile::default().eof(), 0);
        let file = file_with(&[(2, CoverageValue::Hit(1)), (7, CoverageValue::Hit(0))]);
        assert_eq!(file.eof(), 7);
    }

    // -- Line shifting ------------------------------------------------------

    #[test]
    fn test_shift_lines_by_diff() {
        // Hunk replaces base lines 2-3 with 3 head lines: net +1.
        let mut file = file_with(&[
            (1, CoverageValue::Hit(1)),
            (2, CoverageValue::Hit(0)),
            (5, CoverageValue::Hit(1)),
        ]);
        let segment = DiffSegment {
            header: SegmentHeader::new(2, Some(2), 2, Some(3)),
            lines: vec![],
        };
        file.shift_lines_by_diff(&[segment]);

        assert_eq!(file.line(1).map(|l| l.coverage), Some(CoverageValue::Hit(1)));
        assert!(file.line(2).is_none(), "touched line is dropped");
        assert_eq!(file.line(6).map(|l| l.coverage), Some(CoverageValue::Hit(1)));
        assert_eq!(file.lines.len(), 2);
    }

    #[test]
    fn test_shift_lines_backward() {
        // Hunk deletes base lines 1-2: net -2.
        let mut file = file_with(&[(3, CoverageValue::Hit(1)), (4, CoverageValue::Hit(0))]);
        let segment = DiffSegment {
            header: SegmentHeader::new(1, Some(2), 0, Some(0)),
            lines: vec![],
        };
        file.shift_lines_by_diff(&[segment]);

        assert_eq!(file.line(1).map(|l| l.coverage), Some(CoverageValue::Hit(1)));
        assert_eq!(file.line(2).map(|l| l.coverage), Some(CoverageValue::Hit(0)));
    }

    #[test]
    fn test_diff_adjusts_tracked_lines() {
        let mut report = CoverageReport::new();
        report
            .files
            .insert("a.rs".to_string(), file_with(&[(5, CoverageValue::Hit(1))]));

        // Balanced hunk: no tracked line moves.
        let balanced = CommitDiff::single(
            "a.rs",
            vec![DiffSegment {
                header: SegmentHeader::new(1, Some(2), 1, Some(2)),
                lines: vec![],
            }],
        );
        assert!(!report.diff_adjusts_tracked_lines(&balanced));

        // Net insertion before the tracked line.
        let shifting = CommitDiff::single(
            "a.rs",
            vec![DiffSegment {
                header: SegmentHeader::new(1, Some(0), 1, Some(2)),
                lines: vec![],
            }],
        );
        assert!(report.diff_adjusts_tracked_lines(&shifting));

        // Untracked file.
        let elsewhere = CommitDiff::single(
            "b.rs",
            vec![DiffSegment {
                header: SegmentHeader::new(1, Some(0), 1, Some(2)),
                lines: vec![],
            }],
        );
        assert!(!report.diff_adjusts_tracked_lines(&elsewhere));
    }
}
