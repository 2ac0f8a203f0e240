use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovcmpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid diff format: {0}")]
    InvalidDiffFormat(String),

    #[error("No coverage report found for commit {0}")]
    MissingComparisonReport(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CovcmpError>;
