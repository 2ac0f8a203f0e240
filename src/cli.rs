//! Command handler functions for the covcmp CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::Path;

use anyhow::Result;

use crate::compare::{ComparisonConfig, FileComparison};
use crate::comparison::{Comparison, PullRequest, PullRequestComparison, Repo};
use crate::provider::ProviderClient;
use crate::report::{CoverageReport, ReportTotals};
use crate::store::SqliteStore;

pub fn cmd_store(
    store: &mut SqliteStore,
    commit: &str,
    file: &Path,
    overwrite: bool,
) -> Result<String> {
    let data = std::fs::read_to_string(file)?;
    let report: CoverageReport = serde_json::from_str(&data)?;
    let totals = report.totals();
    store.insert_report(commit, &report, overwrite)?;
    Ok(format!(
        "Stored report for commit {} ({} files, {} lines)\n",
        commit, totals.files, totals.lines,
    ))
}

pub fn cmd_commits(store: &SqliteStore) -> Result<String> {
    let commits = store.list_commits()?;
    if commits.is_empty() {
        return Ok("No reports in database.\n".to_string());
    }
    let mut out = String::new();
    writeln!(out, "{:<42} CREATED", "COMMIT").unwrap();
    writeln!(out, "{}", "-".repeat(70)).unwrap();
    for (sha, created) in &commits {
        writeln!(out, "{:<42} {}", sha, created).unwrap();
    }
    Ok(out)
}

pub fn cmd_delete(store: &mut SqliteStore, commit: &str) -> Result<String> {
    store.delete_report(commit)?;
    Ok(format!("Deleted report for commit {}\n", commit))
}

fn fmt_coverage(totals: Option<&ReportTotals>) -> String {
    match totals.and_then(|t| t.coverage) {
        Some(pct) => format!("{:.1}%", pct),
        None => "-".to_string(),
    }
}

pub fn cmd_compare(
    store: &SqliteStore,
    provider: &dyn ProviderClient,
    base: &str,
    head: &str,
    config: ComparisonConfig,
) -> Result<String> {
    let comparison = Comparison::new(store, provider, base, head, config)?;

    let mut out = String::new();
    writeln!(out, "Comparing {}..{}", base, head).unwrap();

    if comparison.has_unmerged_base_commits()? {
        writeln!(
            out,
            "Note: {} is not fully merged into {}; coverage changes may include unrelated commits",
            base, head
        )
        .unwrap();
    }
    writeln!(out).unwrap();

    writeln!(
        out,
        "{:<50} {:>8} {:>8} {:>8}  CHANGES",
        "FILE", "BASE", "HEAD", "PATCH"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(90)).unwrap();

    for file in comparison.files_with_summaries() {
        let totals = file.totals();
        let name = file.name().head.unwrap_or("-");
        let changes = file.change_summary();
        let changes = if changes.is_empty() {
            String::new()
        } else {
            changes.to_string()
        };
        writeln!(
            out,
            "{:<50} {:>8} {:>8} {:>8}  {}",
            name,
            fmt_coverage(totals.base.as_ref()),
            fmt_coverage(totals.head.as_ref()),
            fmt_coverage(totals.diff.as_ref()),
            changes,
        )
        .unwrap();
    }

    let totals = comparison.totals();
    writeln!(out, "{}", "-".repeat(90)).unwrap();
    writeln!(
        out,
        "{:<50} {:>8} {:>8}",
        "TOTAL",
        fmt_coverage(Some(&totals.base)),
        fmt_coverage(Some(&totals.head)),
    )
    .unwrap();

    Ok(out)
}

/// Render a single file's line-by-line comparison.
fn format_file_lines(out: &mut String, file: &FileComparison<'_>) {
    writeln!(out, "{:>6} {:>6}  {:>8} {:>8}  LINE", "BASE", "HEAD", "WAS", "NOW").unwrap();
    writeln!(out, "{}", "-".repeat(60)).unwrap();

    let Some(lines) = file.lines() else {
        writeln!(out, "(diff too large to list line by line)").unwrap();
        return;
    };
    for line in lines {
        let fmt_number = |n: Option<u32>| match n {
            Some(n) => n.to_string(),
            None => String::new(),
        };
        let fmt_state = |s| match s {
            Some(state) => format!("{}", state),
            None => "-".to_string(),
        };
        let marker = if line.added {
            "+"
        } else if line.removed {
            "-"
        } else {
            " "
        };
        writeln!(
            out,
            "{:>6} {:>6}  {:>8} {:>8}  {}{}",
            fmt_number(line.number.base),
            fmt_number(line.number.head),
            fmt_state(line.coverage.base),
            fmt_state(line.coverage.head),
            marker,
            line.value,
        )
        .unwrap();
    }
}

pub fn cmd_file(
    store: &SqliteStore,
    provider: &dyn ProviderClient,
    base: &str,
    head: &str,
    path: &str,
    with_src: bool,
    config: ComparisonConfig,
) -> Result<String> {
    let comparison = Comparison::new(store, provider, base, head, config)?;
    let file = comparison.get_file_comparison(path, with_src)?;

    let mut out = String::new();
    writeln!(out, "{} ({}..{})", path, base, head).unwrap();
    let totals = file.totals();
    writeln!(
        out,
        "Coverage: {} -> {}",
        fmt_coverage(totals.base.as_ref()),
        fmt_coverage(totals.head.as_ref()),
    )
    .unwrap();
    if let Some(diff_totals) = totals.diff.as_ref() {
        writeln!(out, "Patch coverage: {}", fmt_coverage(Some(diff_totals))).unwrap();
    }
    let changes = file.change_summary();
    if !changes.is_empty() {
        writeln!(out, "Indirect changes: {}", changes).unwrap();
    }
    writeln!(out).unwrap();
    format_file_lines(&mut out, &file);
    Ok(out)
}

pub fn cmd_changes(
    store: &SqliteStore,
    provider: &dyn ProviderClient,
    repo: Repo,
    pull: PullRequest,
    config: ComparisonConfig,
) -> Result<String> {
    let mut prc = PullRequestComparison::new(store, provider, store, repo, pull, config)?;

    let mut out = String::new();
    if prc.is_pseudo_comparison() && prc.pseudo_diff_adjusts_tracked_lines()? {
        if prc.allow_coverage_offsets() {
            prc.update_base_report_with_pseudo_diff()?;
            writeln!(
                out,
                "Base report re-aligned to account for commits behind the pull request base."
            )
            .unwrap();
        } else {
            writeln!(
                out,
                "Note: the comparison base trails the pull request base; line numbers may be shifted."
            )
            .unwrap();
        }
    }

    let changed = prc.files_with_changes();
    if changed.is_empty() {
        writeln!(out, "No files with indirect coverage changes.").unwrap();
        return Ok(out);
    }

    writeln!(out, "Files with indirect coverage changes:").unwrap();
    for file in prc.files() {
        let Some(name) = file.name().head else {
            continue;
        };
        if !changed.iter().any(|f| f == name) {
            continue;
        }
        writeln!(out, "  {:<50} {}", name, file.change_summary()).unwrap();
    }
    Ok(out)
}
