//! VCS provider abstraction: where commit diffs and file contents come from.
//!
//! The comparison engine only sees the [`ProviderClient`] trait; concrete
//! implementations shell out to a local git checkout (here) or call the
//! GitHub API (see [`crate::github`]).

use std::path::PathBuf;
use std::process::Command;

use crate::diff::{parse_diff, CommitDiff};
use crate::error::{CovcmpError, Result};

/// Result of comparing two commits.
#[derive(Debug, Clone, Default)]
pub struct CompareResponse {
    /// Commits reachable from head but not base, head first.
    pub commits: Vec<String>,
    pub diff: CommitDiff,
}

/// A source of commit comparisons and file contents.
pub trait ProviderClient {
    /// Compare two commits: the commit list between them and their diff.
    fn get_compare(&self, base: &str, head: &str) -> Result<CompareResponse>;

    /// Fetch a file's full content at a commit.
    fn get_source(&self, path: &str, commit: &str) -> Result<Vec<u8>>;
}

/// Provider backed by a local git checkout.
pub struct GitProvider {
    /// Repository working directory.
    pub repo_dir: PathBuf,
}

impl GitProvider {
    #[must_use]
    pub fn new(repo_dir: PathBuf) -> Self {
        Self { repo_dir }
    }

    fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .current_dir(&self.repo_dir)
            .args(args)
            .output()
            .map_err(|err| CovcmpError::Provider(format!("failed to run git: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CovcmpError::Provider(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    fn git_text(&self, args: &[&str]) -> Result<String> {
        let stdout = self.git(args)?;
        String::from_utf8(stdout)
            .map_err(|_| CovcmpError::Provider("git output not valid UTF-8".to_string()))
    }
}

impl ProviderClient for GitProvider {
    fn get_compare(&self, base: &str, head: &str) -> Result<CompareResponse> {
        let range = format!("{base}..{head}");
        let commits = self
            .git_text(&["rev-list", &range])?
            .lines()
            .map(str::to_string)
            .collect();

        let diff_text = self.git_text(&["diff", base, head])?;
        let diff = parse_diff(&diff_text)?;

        Ok(CompareResponse { commits, diff })
    }

    fn get_source(&self, path: &str, commit: &str) -> Result<Vec<u8>> {
        self.git(&["show", &format!("{commit}:{path}")])
    }
}
