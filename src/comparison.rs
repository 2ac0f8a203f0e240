//! Commit-to-commit comparison orchestration.
//!
//! [`Comparison`] resolves both commits' coverage reports and the provider
//! diff up front, then hands out per-file [`FileComparison`]s.
//! [`PullRequestComparison`] layers on pull-request specifics: the
//! previously-notified `compared_to` base, the changed-files cache, and the
//! pseudo-diff re-alignment of a stale base report.

use crate::compare::{ComparisonConfig, FileComparison, Sides};
use crate::diff::CommitDiff;
use crate::error::Result;
use crate::provider::ProviderClient;
use crate::report::{CoverageReport, ReportTotals};

/// Changed-files cache entries live for one day.
pub const CHANGED_FILES_TTL_SECS: u64 = 86_400;

/// Supplies a commit's coverage report. Errors with
/// [`crate::error::CovcmpError::MissingComparisonReport`] when the commit
/// has no stored report; that is surfaced to the caller, never retried.
pub trait ReportStore {
    fn build_report(&self, commit: &str) -> Result<CoverageReport>;
}

/// External key-value cache for the changed-files list. Implementations may
/// fail freely: every failure is caught at the call site and treated as a
/// miss (read) or dropped (write).
pub trait ChangedFilesCache {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
}

/// Repository identity, used to build cache keys.
#[derive(Debug, Clone)]
pub struct Repo {
    pub service: String,
    pub owner: String,
    pub name: String,
}

/// The pull request being compared. `compared_to` is the base commit the
/// last notification used, which may trail the literal base when the target
/// branch advanced in the meantime.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub pullid: u64,
    pub base: String,
    pub head: String,
    pub compared_to: Option<String>,
}

/// A resolved comparison between two commits.
pub struct Comparison<'a> {
    provider: &'a dyn ProviderClient,
    config: ComparisonConfig,
    base_commit: String,
    head_commit: String,
    base_report: CoverageReport,
    head_report: CoverageReport,
    diff: CommitDiff,
}

impl<'a> Comparison<'a> {
    /// Resolve both reports and the provider diff. Fails with
    /// `MissingComparisonReport` when either commit has no stored report.
    pub fn new(
        store: &dyn ReportStore,
        provider: &'a dyn ProviderClient,
        base_commit: &str,
        head_commit: &str,
        config: ComparisonConfig,
    ) -> Result<Self> {
        let base_report = store.build_report(base_commit)?;
        let head_report = store.build_report(head_commit)?;
        let diff = provider.get_compare(base_commit, head_commit)?.diff;

        Ok(Self {
            provider,
            config,
            base_commit: base_commit.to_string(),
            head_commit: head_commit.to_string(),
            base_report,
            head_report,
            diff,
        })
    }

    #[must_use]
    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    #[must_use]
    pub fn head_commit(&self) -> &str {
        &self.head_commit
    }

    #[must_use]
    pub fn base_report(&self) -> &CoverageReport {
        &self.base_report
    }

    #[must_use]
    pub fn head_report(&self) -> &CoverageReport {
        &self.head_report
    }

    #[must_use]
    pub fn diff(&self) -> &CommitDiff {
        &self.diff
    }

    #[must_use]
    pub fn totals(&self) -> Sides<ReportTotals> {
        Sides {
            base: self.base_report.totals(),
            head: self.head_report.totals(),
        }
    }

    /// One [`FileComparison`] per file in the head report, joined against
    /// the base report (under the diff's `before` name for renames) and the
    /// per-file diff entry. Oversized diffs get their line listings
    /// suppressed here; use [`Comparison::get_file_comparison`] for full
    /// single-file detail.
    #[must_use]
    pub fn files(&self) -> Vec<FileComparison<'_>> {
        self.head_report
            .files
            .keys()
            .map(|name| self.build_file_comparison(name, None, false, Vec::new()))
            .collect()
    }

    /// Like [`Comparison::files`], but with the change-summary pass forced
    /// on regardless of available source text.
    #[must_use]
    pub fn files_with_summaries(&self) -> Vec<FileComparison<'_>> {
        self.head_report
            .files
            .keys()
            .map(|name| self.build_file_comparison(name, Some(true), false, Vec::new()))
            .collect()
    }

    /// Single-file comparison, bypassing the diff size cap. With
    /// `with_src`, the head file's content is fetched through the provider
    /// so untracked lines are displayable too.
    pub fn get_file_comparison<'s>(
        &'s self,
        file_name: &'s str,
        with_src: bool,
    ) -> Result<FileComparison<'s>> {
        let src = if with_src {
            let content = self.provider.get_source(file_name, &self.head_commit)?;
            // Content may be arbitrary bytes; compare what we can read.
            String::from_utf8_lossy(&content)
                .lines()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        Ok(self.build_file_comparison(file_name, None, true, src))
    }

    /// True when the base is not an ancestor of head: the reverse
    /// comparison (head back to base) reports intervening commits.
    pub fn has_unmerged_base_commits(&self) -> Result<bool> {
        let reverse = self
            .provider
            .get_compare(&self.head_commit, &self.base_commit)?;
        Ok(reverse.commits.len() > 1)
    }

    fn build_file_comparison<'s>(
        &'s self,
        name: &'s str,
        should_search_for_changes: Option<bool>,
        bypass_max_diff_size: bool,
        src: Vec<String>,
    ) -> FileComparison<'s> {
        let head = self.head_report.file(name).map(|file| (name, file));
        let diff = self.diff.file(name);
        let base_name = diff
            .and_then(|d| d.before.as_deref())
            .unwrap_or(name);
        let base = self.base_report.file(base_name).map(|file| (base_name, file));

        FileComparison::new(
            base,
            head,
            diff,
            src,
            should_search_for_changes,
            &self.config,
            bypass_max_diff_size,
        )
    }
}

/// A comparison for a pull request, based on its previously-notified
/// `compared_to` commit when one is recorded.
pub struct PullRequestComparison<'a> {
    comparison: Comparison<'a>,
    cache: &'a dyn ChangedFilesCache,
    repo: Repo,
    pull: PullRequest,
}

impl<'a> PullRequestComparison<'a> {
    pub fn new(
        store: &dyn ReportStore,
        provider: &'a dyn ProviderClient,
        cache: &'a dyn ChangedFilesCache,
        repo: Repo,
        pull: PullRequest,
        config: ComparisonConfig,
    ) -> Result<Self> {
        let base_commit = pull.compared_to.clone().unwrap_or_else(|| pull.base.clone());
        let comparison = Comparison::new(store, provider, &base_commit, &pull.head, config)?;

        Ok(Self {
            comparison,
            cache,
            repo,
            pull,
        })
    }

    #[must_use]
    pub fn comparison(&self) -> &Comparison<'a> {
        &self.comparison
    }

    #[must_use]
    pub fn pull(&self) -> &PullRequest {
        &self.pull
    }

    fn cache_key(&self) -> String {
        format!(
            "compare-changed-files/{}/{}/{}/{}",
            self.repo.service, self.repo.owner, self.repo.name, self.pull.pullid
        )
    }

    /// The cached changed-files list, if present and readable. Cache
    /// problems are warnings, never errors.
    fn cached_files_with_changes(&self) -> Option<Vec<String>> {
        let key = self.cache_key();
        match self.cache.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(files) => Some(files),
                Err(err) => {
                    eprintln!("Warning: ignoring unreadable changed-files cache entry: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                eprintln!("Warning: changed-files cache read failed: {err}");
                None
            }
        }
    }

    /// Filenames with genuine coverage changes (non-empty change summary),
    /// computed by traversing every file and cached for a day. Cache writes
    /// are best-effort.
    pub fn files_with_changes(&self) -> Vec<String> {
        if let Some(files) = self.cached_files_with_changes() {
            return files;
        }

        let changed: Vec<String> = self
            .comparison
            .head_report
            .files
            .keys()
            .filter(|name| {
                let file = self
                    .comparison
                    .build_file_comparison(name, Some(true), false, Vec::new());
                !file.change_summary().is_empty()
            })
            .cloned()
            .collect();

        match serde_json::to_string(&changed) {
            Ok(value) => {
                if let Err(err) = self.cache.set(&self.cache_key(), &value, CHANGED_FILES_TTL_SECS)
                {
                    eprintln!("Warning: changed-files cache write failed: {err}");
                }
            }
            Err(err) => eprintln!("Warning: could not serialize changed-files list: {err}"),
        }

        changed
    }

    /// Per-file comparisons with `should_search_for_changes` resolved from
    /// the cache: known-changed files must compute summaries, known-clean
    /// files skip the work, and without a cache entry each file decides on
    /// its own.
    #[must_use]
    pub fn files(&self) -> Vec<FileComparison<'_>> {
        let known = self.cached_files_with_changes();
        self.comparison
            .head_report
            .files
            .keys()
            .map(|name| {
                let should_search = known
                    .as_ref()
                    .map(|changed| changed.iter().any(|f| f == name));
                self.comparison
                    .build_file_comparison(name, should_search, false, Vec::new())
            })
            .collect()
    }

    /// A pseudo comparison compares against `compared_to` instead of the
    /// literal base. Never pseudo when the two coincide, regardless of
    /// configuration.
    #[must_use]
    pub fn is_pseudo_comparison(&self) -> bool {
        match &self.pull.compared_to {
            Some(compared_to) => {
                *compared_to != self.pull.base && self.comparison.config.allow_pseudo_compare
            }
            None => false,
        }
    }

    #[must_use]
    pub fn allow_coverage_offsets(&self) -> bool {
        self.comparison.config.allow_coverage_offsets
    }

    /// The synthetic diff from `compared_to` up to the pull's literal base.
    fn pseudo_diff(&self) -> Result<CommitDiff> {
        let compared_to = self
            .pull
            .compared_to
            .as_deref()
            .unwrap_or(&self.pull.base);
        Ok(self
            .comparison
            .provider
            .get_compare(compared_to, &self.pull.base)?
            .diff)
    }

    /// True when the pseudo-diff would move tracked line numbers in the
    /// base report, meaning the report must be re-aligned before use.
    pub fn pseudo_diff_adjusts_tracked_lines(&self) -> Result<bool> {
        if !self.is_pseudo_comparison() {
            return Ok(false);
        }
        let pseudo_diff = self.pseudo_diff()?;
        Ok(self
            .comparison
            .base_report
            .diff_adjusts_tracked_lines(&pseudo_diff))
    }

    /// Shift every tracked line in the base report according to the
    /// pseudo-diff, in place, for the remainder of the request.
    pub fn update_base_report_with_pseudo_diff(&mut self) -> Result<()> {
        let pseudo_diff = self.pseudo_diff()?;
        self.comparison.base_report.shift_lines_by_diff(&pseudo_diff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;
    use crate::diff::{DiffLine, DiffSegment, SegmentHeader};
    use crate::error::CovcmpError;
    use crate::provider::CompareResponse;
    use crate::report::{CoverageValue, ReportFile, ReportLine};

    struct StubStore {
        reports: BTreeMap<String, CoverageReport>,
    }

    impl ReportStore for StubStore {
        fn build_report(&self, commit: &str) -> Result<CoverageReport> {
            self.reports
                .get(commit)
                .cloned()
                .ok_or_else(|| CovcmpError::MissingComparisonReport(commit.to_string()))
        }
    }

    struct StubProvider {
        diff: CommitDiff,
        pseudo_diff: CommitDiff,
        reverse_commits: Vec<String>,
        source: Vec<u8>,
    }

    impl Default for StubProvider {
        fn default() -> Self {
            Self {
                diff: CommitDiff::default(),
                pseudo_diff: CommitDiff::default(),
                reverse_commits: vec![],
                source: b"fn main() {\n    println!(\"hi\");\n}\n".to_vec(),
            }
        }
    }

    impl ProviderClient for StubProvider {
        fn get_compare(&self, base: &str, head: &str) -> Result<CompareResponse> {
            // Reverse lookups flow head-to-base; pseudo-diff lookups end at
            // the pull's literal base.
            if base == "head" {
                return Ok(CompareResponse {
                    commits: self.reverse_commits.clone(),
                    diff: CommitDiff::default(),
                });
            }
            if head == "base" {
                return Ok(CompareResponse {
                    commits: vec![],
                    diff: self.pseudo_diff.clone(),
                });
            }
            Ok(CompareResponse {
                commits: vec!["head".to_string()],
                diff: self.diff.clone(),
            })
        }

        fn get_source(&self, _path: &str, _commit: &str) -> Result<Vec<u8>> {
            Ok(self.source.clone())
        }
    }

    #[derive(Default)]
    struct StubCache {
        entries: RefCell<BTreeMap<String, String>>,
        sets: RefCell<u32>,
        fail: bool,
    }

    impl ChangedFilesCache for StubCache {
        fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail {
                return Err(CovcmpError::Other("cache down".to_string()));
            }
            Ok(self.entries.borrow().get(key).cloned())
        }

        fn set(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<()> {
            if self.fail {
                return Err(CovcmpError::Other("cache down".to_string()));
            }
            *self.sets.borrow_mut() += 1;
            self.entries
                .borrow_mut()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    fn file_with(lines: &[(u32, CoverageValue)]) -> ReportFile {
        let mut file = ReportFile::default();
        for &(number, coverage) in lines {
            file.lines.insert(number, ReportLine::new(coverage));
        }
        file
    }

    fn report_with(files: &[(&str, ReportFile)]) -> CoverageReport {
        let mut report = CoverageReport::new();
        for (name, file) in files {
            report.files.insert(name.to_string(), file.clone());
        }
        report
    }

    fn store_with(base: CoverageReport, head: CoverageReport) -> StubStore {
        let mut reports = BTreeMap::new();
        reports.insert("base".to_string(), base);
        reports.insert("head".to_string(), head);
        StubStore { reports }
    }

    fn drifted_reports() -> (CoverageReport, CoverageReport) {
        // a.rs drifts from miss to hit on line 1; b.rs is unchanged.
        let base = report_with(&[
            ("a.rs", file_with(&[(1, CoverageValue::Hit(0))])),
            ("b.rs", file_with(&[(1, CoverageValue::Hit(1))])),
        ]);
        let head = report_with(&[
            ("a.rs", file_with(&[(1, CoverageValue::Hit(1))])),
            ("b.rs", file_with(&[(1, CoverageValue::Hit(1))])),
        ]);
        (base, head)
    }

    // -- Comparison ---------------------------------------------------------

    #[test]
    fn test_missing_report_surfaces() {
        let store = StubStore {
            reports: BTreeMap::new(),
        };
        let provider = StubProvider::default();
        let result = Comparison::new(&store, &provider, "base", "head", ComparisonConfig::default());
        assert!(matches!(
            result,
            Err(CovcmpError::MissingComparisonReport(sha)) if sha == "base"
        ));
    }

    #[test]
    fn test_files_one_per_head_file() {
        let (base, head) = drifted_reports();
        let store = store_with(base, head);
        let provider = StubProvider::default();
        let comparison =
            Comparison::new(&store, &provider, "base", "head", ComparisonConfig::default())
                .unwrap();

        let files = comparison.files();
        assert_eq!(files.len(), 2);
        let names: Vec<_> = files.iter().map(|f| f.name().head.unwrap()).collect();
        assert_eq!(names, ["a.rs", "b.rs"]);
    }

    #[test]
    fn test_rename_joins_base_by_before_name() {
        let base = report_with(&[("old.rs", file_with(&[(1, CoverageValue::Hit(1))]))]);
        let head = report_with(&[("new.rs", file_with(&[(1, CoverageValue::Hit(1))]))]);
        let store = store_with(base, head);

        let mut diff = CommitDiff::single("new.rs", vec![]);
        if let Some(fd) = diff.files.get_mut("new.rs") {
            fd.before = Some("old.rs".to_string());
        }
        let provider = StubProvider {
            diff,
            ..Default::default()
        };
        let comparison =
            Comparison::new(&store, &provider, "base", "head", ComparisonConfig::default())
                .unwrap();

        let files = comparison.files();
        assert_eq!(files[0].name().base, Some("old.rs"));
        assert_eq!(files[0].name().head, Some("new.rs"));
    }

    #[test]
    fn test_get_file_comparison_with_src() {
        let (base, head) = drifted_reports();
        let store = store_with(base, head);
        let provider = StubProvider::default();
        let comparison =
            Comparison::new(&store, &provider, "base", "head", ComparisonConfig::default())
                .unwrap();

        let file = comparison.get_file_comparison("a.rs", true).unwrap();
        let lines = file.lines().unwrap();
        assert_eq!(lines[0].value, "fn main() {");
        // Unknown state plus source present: the summary pass runs.
        assert!(file.searched_for_changes());
    }

    #[test]
    fn test_has_unmerged_base_commits() {
        let (base, head) = drifted_reports();
        let store = store_with(base.clone(), head.clone());
        let provider = StubProvider {
            reverse_commits: vec!["x".to_string(), "y".to_string()],
            ..Default::default()
        };
        let comparison =
            Comparison::new(&store, &provider, "base", "head", ComparisonConfig::default())
                .unwrap();
        assert!(comparison.has_unmerged_base_commits().unwrap());

        let store = store_with(base, head);
        let provider = StubProvider::default();
        let comparison =
            Comparison::new(&store, &provider, "base", "head", ComparisonConfig::default())
                .unwrap();
        assert!(!comparison.has_unmerged_base_commits().unwrap());
    }

    // -- PullRequestComparison ----------------------------------------------

    fn pull(compared_to: Option<&str>) -> PullRequest {
        PullRequest {
            pullid: 42,
            base: "base".to_string(),
            head: "head".to_string(),
            compared_to: compared_to.map(str::to_string),
        }
    }

    fn repo() -> Repo {
        Repo {
            service: "github".to_string(),
            owner: "acme".to_string(),
            name: "widget".to_string(),
        }
    }

    #[test]
    fn test_files_with_changes_computes_and_caches() {
        let (base, head) = drifted_reports();
        let store = store_with(base, head);
        let provider = StubProvider::default();
        let cache = StubCache::default();
        let prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(None),
            ComparisonConfig::default(),
        )
        .unwrap();

        let changed = prc.files_with_changes();
        assert_eq!(changed, ["a.rs"]);
        assert_eq!(*cache.sets.borrow(), 1);
        assert!(cache
            .entries
            .borrow()
            .contains_key("compare-changed-files/github/acme/widget/42"));

        // A second call is served from the cache.
        let again = prc.files_with_changes();
        assert_eq!(again, ["a.rs"]);
        assert_eq!(*cache.sets.borrow(), 1);
    }

    #[test]
    fn test_cache_failures_are_not_fatal() {
        let (base, head) = drifted_reports();
        let store = store_with(base, head);
        let provider = StubProvider::default();
        let cache = StubCache {
            fail: true,
            ..Default::default()
        };
        let prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(None),
            ComparisonConfig::default(),
        )
        .unwrap();

        assert_eq!(prc.files_with_changes(), ["a.rs"]);
    }

    #[test]
    fn test_files_resolve_search_flag_from_cache() {
        let (base, head) = drifted_reports();
        let store = store_with(base, head);
        let provider = StubProvider::default();
        let cache = StubCache::default();
        cache.entries.borrow_mut().insert(
            "compare-changed-files/github/acme/widget/42".to_string(),
            r#"["a.rs"]"#.to_string(),
        );
        let prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(None),
            ComparisonConfig::default(),
        )
        .unwrap();

        let files = prc.files();
        // a.rs is known-changed: the summary pass ran and found the drift.
        assert!(files[0].searched_for_changes());
        assert!(!files[0].change_summary().is_empty());
        // b.rs is known-clean: the pass is skipped entirely.
        assert!(!files[1].searched_for_changes());
    }

    #[test]
    fn test_pseudo_comparison_requires_distinct_compared_to() {
        let (base, head) = drifted_reports();
        let config = ComparisonConfig {
            allow_pseudo_compare: true,
            ..Default::default()
        };
        let provider = StubProvider::default();
        let cache = StubCache::default();

        // compared_to == base: never pseudo, even with the flag on.
        let store = store_with(base.clone(), head.clone());
        let prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(Some("base")),
            config.clone(),
        )
        .unwrap();
        assert!(!prc.is_pseudo_comparison());
        assert!(!prc.pseudo_diff_adjusts_tracked_lines().unwrap());

        // Distinct compared_to with the flag on: pseudo.
        let mut reports = BTreeMap::new();
        reports.insert("notified".to_string(), base.clone());
        reports.insert("head".to_string(), head.clone());
        let store = StubStore { reports };
        let prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(Some("notified")),
            config,
        )
        .unwrap();
        assert!(prc.is_pseudo_comparison());

        // Flag off: never pseudo.
        let mut reports = BTreeMap::new();
        reports.insert("notified".to_string(), base);
        reports.insert("head".to_string(), head);
        let store = StubStore { reports };
        let prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(Some("notified")),
            ComparisonConfig::default(),
        )
        .unwrap();
        assert!(!prc.is_pseudo_comparison());
    }

    #[test]
    fn test_update_base_report_with_pseudo_diff() {
        let base = report_with(&[("a.rs", file_with(&[(2, CoverageValue::Hit(1))]))]);
        let head = report_with(&[("a.rs", file_with(&[(1, CoverageValue::Hit(1))]))]);
        let mut reports = BTreeMap::new();
        reports.insert("notified".to_string(), base);
        reports.insert("head".to_string(), head);
        let store = StubStore { reports };

        // Pseudo-diff inserts two lines at the top of a.rs.
        let pseudo_diff = CommitDiff::single(
            "a.rs",
            vec![DiffSegment {
                header: SegmentHeader::new(1, Some(0), 1, Some(2)),
                lines: vec![
                    DiffLine::Added("one".to_string()),
                    DiffLine::Added("two".to_string()),
                ],
            }],
        );
        let provider = StubProvider {
            pseudo_diff,
            ..Default::default()
        };
        let cache = StubCache::default();
        let config = ComparisonConfig {
            allow_pseudo_compare: true,
            ..Default::default()
        };
        let mut prc = PullRequestComparison::new(
            &store,
            &provider,
            &cache,
            repo(),
            pull(Some("notified")),
            config,
        )
        .unwrap();

        assert!(prc.pseudo_diff_adjusts_tracked_lines().unwrap());
        prc.update_base_report_with_pseudo_diff().unwrap();

        let shifted = prc.comparison().base_report().file("a.rs").unwrap();
        assert!(shifted.line(4).is_some());
        assert!(shifted.line(2).is_none());
    }
}
