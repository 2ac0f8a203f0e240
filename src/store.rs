use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::comparison::{ChangedFilesCache, ReportStore};
use crate::error::{CovcmpError, Result};
use crate::report::CoverageReport;

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = include_str!("../schema.sql");

/// Open (or create) the covcmp database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

/// Ensure the schema is initialized. Safe to call on an already-initialized DB.
/// Performs forward migrations when the on-disk schema version is older than
/// `SCHEMA_VERSION`.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    // Check or insert schema version
    let count: u32 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?;
    if count == 0 {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    } else {
        let version: u32 =
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })?;
        if version == SCHEMA_VERSION {
            return Ok(());
        }
        if version > SCHEMA_VERSION {
            return Err(CovcmpError::Other(format!(
                "Database schema version {} is newer than this binary supports ({}). \
                 Please upgrade covcmp.",
                version, SCHEMA_VERSION
            )));
        }
        // Forward migration: apply each step from `version` to `SCHEMA_VERSION`.
        migrate(conn, version)?;
    }
    Ok(())
}

/// Apply migrations from `from_version` up to (and including) `SCHEMA_VERSION`.
/// Each migration step is a function that transforms the schema.
///
/// To add a new migration:
///   1. Bump `SCHEMA_VERSION`.
///   2. Add a new arm `N => { ... }` that migrates from version N to N+1.
///   3. Update schema.sql to reflect the final state (new installs skip migrations).
#[allow(unused_mut, unused_variables, clippy::never_loop)]
fn migrate(conn: &Connection, from_version: u32) -> Result<()> {
    let mut current = from_version;
    while current < SCHEMA_VERSION {
        eprintln!(
            "Migrating database schema from version {} to {} ...",
            current,
            current + 1
        );
        #[allow(clippy::match_single_binding)]
        match current {
            // Example migration steps (add real ones as schema evolves):
            // 1 => {
            //     conn.execute_batch("ALTER TABLE report ADD COLUMN metadata TEXT;")?;
            // }
            _ => {
                return Err(CovcmpError::Other(format!(
                    "No migration path from schema version {} to {}. \
                     Consider deleting the database and re-storing reports.",
                    current,
                    current + 1
                )));
            }
        }
        // Note: when real migration arms are added above, they should not
        // return early — execution will fall through to here to bump the
        // version and continue.
        #[allow(unreachable_code)]
        {
            current += 1;
            conn.execute("UPDATE schema_version SET version = ?1", params![current])?;
        }
    }
    Ok(())
}

/// SQLite-backed report store. Also serves as the changed-files cache so a
/// single database file covers both concerns.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` with the schema initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Store a commit's coverage report. Refuses to replace an existing
    /// report unless `overwrite` is set.
    pub fn insert_report(
        &mut self,
        commit: &str,
        report: &CoverageReport,
        overwrite: bool,
    ) -> Result<()> {
        let data = serde_json::to_string(report)?;
        let now = Utc::now().to_rfc3339();
        let sql = if overwrite {
            "INSERT OR REPLACE INTO report (commit_sha, data, created_at) VALUES (?1, ?2, ?3)"
        } else {
            "INSERT INTO report (commit_sha, data, created_at) VALUES (?1, ?2, ?3)"
        };
        self.conn
            .execute(sql, params![commit, data, now])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    CovcmpError::Other(format!(
                        "A report for commit '{}' already exists. Use --overwrite to replace it.",
                        commit
                    ))
                }
                other => CovcmpError::Sqlite(other),
            })?;
        Ok(())
    }

    /// All stored commits as (sha, created_at) pairs, oldest first.
    pub fn list_commits(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT commit_sha, created_at FROM report ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Delete a commit's report. Errors when no report is stored for it.
    pub fn delete_report(&mut self, commit: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM report WHERE commit_sha = ?1", params![commit])?;
        if deleted == 0 {
            return Err(CovcmpError::MissingComparisonReport(commit.to_string()));
        }
        Ok(())
    }

    /// Drop cache entries past their expiry. Returns the number removed.
    pub fn purge_expired_cache(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let purged = self.conn.execute(
            "DELETE FROM changed_files_cache WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(purged)
    }
}

impl ReportStore for SqliteStore {
    fn build_report(&self, commit: &str) -> Result<CoverageReport> {
        let data: String = self
            .conn
            .query_row(
                "SELECT data FROM report WHERE commit_sha = ?1",
                params![commit],
                |row| row.get(0),
            )
            .map_err(|_| CovcmpError::MissingComparisonReport(commit.to_string()))?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl ChangedFilesCache for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT value, expires_at FROM changed_files_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((value, expires_at)) = row else {
            return Ok(None);
        };
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| CovcmpError::Other(format!("Invalid cache expiry timestamp: {}", e)))?;
        if expires_at <= Utc::now() {
            self.conn.execute(
                "DELETE FROM changed_files_cache WHERE key = ?1",
                params![key],
            )?;
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires_at = (Utc::now() + Duration::seconds(ttl_secs as i64)).to_rfc3339();
        self.conn.execute(
            "INSERT OR REPLACE INTO changed_files_cache (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{CoverageValue, ReportFile, ReportLine};

    /// Create a store backed by an in-memory database.
    fn test_store() -> SqliteStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        SqliteStore { conn }
    }

    fn sample_report() -> CoverageReport {
        let mut file = ReportFile::default();
        file.lines.insert(1, ReportLine::new(CoverageValue::Hit(3)));
        file.lines.insert(2, ReportLine::new(CoverageValue::Hit(0)));
        let mut report = CoverageReport::new();
        report.files.insert("src/lib.rs".to_string(), file);
        report
    }

    #[test]
    fn test_init_schema_idempotent() {
        let store = test_store();
        init_schema(&store.conn).unwrap();

        let version: u32 = store
            .conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_report_roundtrip() {
        let mut store = test_store();
        let report = sample_report();

        store.insert_report("abc123", &report, false).unwrap();
        let loaded = store.build_report("abc123").unwrap();

        assert_eq!(loaded, report);
    }

    #[test]
    fn test_missing_report() {
        let store = test_store();

        let result = store.build_report("deadbeef");
        assert!(matches!(
            result,
            Err(CovcmpError::MissingComparisonReport(sha)) if sha == "deadbeef"
        ));
    }

    #[test]
    fn test_duplicate_report_rejected_without_overwrite() {
        let mut store = test_store();
        let report = sample_report();

        store.insert_report("abc123", &report, false).unwrap();
        let result = store.insert_report("abc123", &report, false);
        assert!(result.is_err());

        // With overwrite the new data replaces the old.
        let mut replacement = CoverageReport::new();
        replacement
            .files
            .insert("src/main.rs".to_string(), ReportFile::default());
        store.insert_report("abc123", &replacement, true).unwrap();
        let loaded = store.build_report("abc123").unwrap();
        assert!(loaded.file("src/main.rs").is_some());
    }

    #[test]
    fn test_list_and_delete() {
        let mut store = test_store();
        let report = sample_report();

        store.insert_report("abc123", &report, false).unwrap();
        store.insert_report("def456", &report, false).unwrap();

        let commits = store.list_commits().unwrap();
        let shas: Vec<&str> = commits.iter().map(|(sha, _)| sha.as_str()).collect();
        assert_eq!(shas.len(), 2);
        assert!(shas.contains(&"abc123"));
        assert!(shas.contains(&"def456"));

        store.delete_report("abc123").unwrap();
        assert_eq!(store.list_commits().unwrap().len(), 1);

        let result = store.delete_report("abc123");
        assert!(matches!(
            result,
            Err(CovcmpError::MissingComparisonReport(_))
        ));
    }

    #[test]
    fn test_cache_roundtrip() {
        let store = test_store();

        assert_eq!(store.get("some-key").unwrap(), None);
        store.set("some-key", r#"["a.rs"]"#, 3600).unwrap();
        assert_eq!(store.get("some-key").unwrap().as_deref(), Some(r#"["a.rs"]"#));
    }

    #[test]
    fn test_cache_expiry() {
        let store = test_store();

        store.set("stale-key", "[]", 0).unwrap();
        assert_eq!(store.get("stale-key").unwrap(), None);

        store.set("stale-key", "[]", 0).unwrap();
        assert_eq!(store.purge_expired_cache().unwrap(), 1);
    }
}
