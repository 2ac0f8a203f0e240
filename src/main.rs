use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use covcmp::cli;
use covcmp::compare::ComparisonConfig;
use covcmp::comparison::{PullRequest, Repo};
use covcmp::github::GitHubProvider;
use covcmp::provider::{GitProvider, ProviderClient};
use covcmp::store::SqliteStore;

/// covcmp — Compare code coverage reports between commits against their diff.
#[derive(Parser)]
#[command(name = "covcmp", version, about)]
struct Cli {
    /// Path to the SQLite database (default: ./.covcmp.db)
    #[arg(long, global = true, default_value = ".covcmp.db")]
    db: PathBuf,

    /// Local git checkout to read diffs and file contents from.
    #[arg(long, global = true, default_value = ".")]
    repo_dir: PathBuf,

    /// Use the GitHub API for diffs and file contents instead of local git.
    /// Takes "owner/name"; requires GITHUB_TOKEN in the environment.
    #[arg(long, global = true)]
    github: Option<String>,

    /// Diffs with more hunk lines than this are summarized without a
    /// line-by-line listing.
    #[arg(long, global = true, default_value_t = 170)]
    max_diff_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a coverage report (JSON) for a commit.
    Store {
        /// Commit SHA the report belongs to.
        commit: String,

        /// Path to the report JSON file.
        file: PathBuf,

        /// Overwrite an existing report for the same commit.
        #[arg(long)]
        overwrite: bool,
    },

    /// List all commits with stored reports.
    Commits,

    /// Delete a commit's stored report.
    Delete {
        /// Commit SHA to delete.
        commit: String,
    },

    /// Compare coverage between two commits.
    Compare {
        /// Base commit SHA.
        base: String,

        /// Head commit SHA.
        head: String,
    },

    /// Show a line-by-line comparison for one file.
    File {
        /// Base commit SHA.
        base: String,

        /// Head commit SHA.
        head: String,

        /// File path (as stored in the coverage reports).
        path: String,

        /// Fetch the file's source from the provider so untracked lines
        /// are listed too.
        #[arg(long)]
        src: bool,
    },

    /// List files with indirect coverage changes for a pull request.
    Changes {
        /// Pull request number.
        pull: u64,

        /// Base commit SHA of the pull request.
        base: String,

        /// Head commit SHA of the pull request.
        head: String,

        /// Commit the last notification compared against, when it trails
        /// the pull request base.
        #[arg(long)]
        compared_to: Option<String>,

        /// Compare against --compared-to instead of the literal base.
        #[arg(long)]
        allow_pseudo_compare: bool,

        /// Re-align the base report when the pseudo-diff shifts tracked
        /// lines.
        #[arg(long)]
        allow_coverage_offsets: bool,
    },
}

fn make_provider(cli: &Cli) -> Result<Box<dyn ProviderClient>> {
    match &cli.github {
        Some(repo) => {
            let token = std::env::var("GITHUB_TOKEN")
                .context("GITHUB_TOKEN environment variable is required with --github")?;
            Ok(Box::new(GitHubProvider::new(token, repo.clone())))
        }
        None => Ok(Box::new(GitProvider::new(cli.repo_dir.clone()))),
    }
}

fn make_repo(cli: &Cli) -> Repo {
    match &cli.github {
        Some(repo) => {
            let (owner, name) = repo.split_once('/').unwrap_or(("", repo.as_str()));
            Repo {
                service: "github".to_string(),
                owner: owner.to_string(),
                name: name.to_string(),
            }
        }
        None => {
            let name = cli
                .repo_dir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "repo".to_string());
            Repo {
                service: "git".to_string(),
                owner: "local".to_string(),
                name,
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut store = SqliteStore::open(&cli.db).context("Failed to open database")?;

    let output = match &cli.command {
        Commands::Store {
            commit,
            file,
            overwrite,
        } => cli::cmd_store(&mut store, commit, file, *overwrite)?,
        Commands::Commits => cli::cmd_commits(&store)?,
        Commands::Delete { commit } => cli::cmd_delete(&mut store, commit)?,
        Commands::Compare { base, head } => {
            let provider = make_provider(&cli)?;
            let config = ComparisonConfig {
                max_diff_size: cli.max_diff_size,
                ..Default::default()
            };
            cli::cmd_compare(&store, provider.as_ref(), base, head, config)?
        }
        Commands::File {
            base,
            head,
            path,
            src,
        } => {
            let provider = make_provider(&cli)?;
            let config = ComparisonConfig {
                max_diff_size: cli.max_diff_size,
                ..Default::default()
            };
            cli::cmd_file(&store, provider.as_ref(), base, head, path, *src, config)?
        }
        Commands::Changes {
            pull,
            base,
            head,
            compared_to,
            allow_pseudo_compare,
            allow_coverage_offsets,
        } => {
            let provider = make_provider(&cli)?;
            let config = ComparisonConfig {
                max_diff_size: cli.max_diff_size,
                allow_pseudo_compare: *allow_pseudo_compare,
                allow_coverage_offsets: *allow_coverage_offsets,
            };
            let repo = make_repo(&cli);
            let pull = PullRequest {
                pullid: *pull,
                base: base.clone(),
                head: head.clone(),
                compared_to: compared_to.clone(),
            };
            cli::cmd_changes(&store, provider.as_ref(), repo, pull, config)?
        }
    };

    print!("{}", output);
    Ok(())
}
