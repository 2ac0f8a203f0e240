//! GitHub API implementation of [`ProviderClient`].
//!
//! Uses the compare endpoint twice per comparison: once with the JSON media
//! type for the commit list, once with the `.diff` media type for the
//! unified diff text.

use std::io::Read;

use serde::Deserialize;

use crate::diff::parse_diff;
use crate::error::{CovcmpError, Result};
use crate::provider::{CompareResponse, ProviderClient};

const API_VERSION: &str = "2022-11-28";

/// Provider backed by the GitHub REST API.
pub struct GitHubProvider {
    token: String,
    /// "owner/name" as in `GITHUB_REPOSITORY`.
    repo: String,
}

#[derive(Deserialize)]
struct CompareBody {
    commits: Vec<CommitEntry>,
}

#[derive(Deserialize)]
struct CommitEntry {
    sha: String,
}

impl GitHubProvider {
    #[must_use]
    pub fn new(token: String, repo: String) -> Self {
        Self { token, repo }
    }

    /// Build a provider from standard GitHub Actions environment variables
    /// (`GITHUB_TOKEN`, `GITHUB_REPOSITORY`).
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN").map_err(|_| {
            CovcmpError::Provider("GITHUB_TOKEN environment variable is required".to_string())
        })?;
        let repo = std::env::var("GITHUB_REPOSITORY").map_err(|_| {
            CovcmpError::Provider("GITHUB_REPOSITORY environment variable is required".to_string())
        })?;
        Ok(Self::new(token, repo))
    }

    fn request(&self, url: &str, accept: &str) -> Result<ureq::Response> {
        ureq::get(url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", accept)
            .set("User-Agent", "covcmp")
            .set("X-GitHub-Api-Version", API_VERSION)
            .call()
            .map_err(|err| CovcmpError::Provider(format!("GitHub request failed: {err}")))
    }
}

impl ProviderClient for GitHubProvider {
    fn get_compare(&self, base: &str, head: &str) -> Result<CompareResponse> {
        let url = format!(
            "https://api.github.com/repos/{}/compare/{}...{}",
            self.repo, base, head
        );

        let body: CompareBody = self
            .request(&url, "application/vnd.github+json")?
            .into_json()
            .map_err(|err| CovcmpError::Provider(format!("bad compare response: {err}")))?;
        let mut commits: Vec<String> = body.commits.into_iter().map(|c| c.sha).collect();
        // The API lists oldest-first; callers expect head-first.
        commits.reverse();

        let diff_text = self
            .request(&url, "application/vnd.github.v3.diff")?
            .into_string()
            .map_err(|err| CovcmpError::Provider(format!("bad diff response: {err}")))?;
        let diff = parse_diff(&diff_text)?;

        Ok(CompareResponse { commits, diff })
    }

    fn get_source(&self, path: &str, commit: &str) -> Result<Vec<u8>> {
        let url = format!(
            "https://api.github.com/repos/{}/contents/{}?ref={}",
            self.repo, path, commit
        );
        let response = self.request(&url, "application/vnd.github.raw+json")?;

        let mut content = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut content)
            .map_err(|err| CovcmpError::Provider(format!("bad contents response: {err}")))?;
        Ok(content)
    }
}
