//! SQLite activity store: WAL-mode `activity_log` table mirroring the JSONL
//! stream, queryable after the fact.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{DiagError, Result};

pub struct SqliteLogger {
    conn: Connection,
    path: PathBuf,
}

/// Row of `activity_log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub key: Option<String>,
    pub path: Option<String>,
    pub bytes: Option<i64>,
    pub count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub details: Option<String>,
}

impl SqliteLogger {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DiagError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO activity_log (
                timestamp, event_type, severity, key, path, bytes, count,
                duration_ms, success, error_code, error_message, details
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            )?
            .execute(params![
                row.timestamp,
                row.event_type,
                row.severity,
                row.key,
                row.path,
                row.bytes,
                row.count,
                row.duration_ms,
                row.success,
                row.error_code,
                row.error_message,
                row.details,
            ])?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, event_type, severity, key, path, bytes, count,
                    duration_ms, success, error_code, error_message, details
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ActivityRow {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    key: row.get(3)?,
                    path: row.get(4)?,
                    bytes: row.get(5)?,
                    count: row.get(6)?,
                    duration_ms: row.get(7)?,
                    success: row.get(8)?,
                    error_code: row.get(9)?,
                    error_message: row.get(10)?,
                    details: row.get(11)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -4000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[DIAG-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            key TEXT,
            path TEXT,
            bytes INTEGER,
            count INTEGER,
            duration_ms INTEGER,
            success INTEGER NOT NULL DEFAULT 1,
            error_code TEXT,
            error_message TEXT,
            details TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_type_time ON activity_log(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_key ON activity_log(key);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, SqliteLogger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = SqliteLogger::open(&dir.path().join("activity.sqlite3")).unwrap();
        (dir, logger)
    }

    fn row(ts: &str, event_type: &str, key: Option<&str>, success: i32) -> ActivityRow {
        ActivityRow {
            timestamp: ts.to_string(),
            event_type: event_type.to_string(),
            severity: "info".to_string(),
            key: key.map(str::to_string),
            path: None,
            bytes: None,
            count: None,
            duration_ms: Some(40),
            success,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    #[test]
    fn schema_created_and_wal_active() {
        let (_dir, logger) = temp_db();
        assert!(logger.is_wal_mode());
        assert!(logger.path().ends_with("activity.sqlite3"));
    }

    #[test]
    fn insert_and_query_recent() {
        let (_dir, logger) = temp_db();
        logger.log_activity(&row("2026-10-01T00:00:00.000Z", "lane_start", Some("k1"), 1)).unwrap();
        logger.log_activity(&row("2026-10-01T00:00:01.000Z", "copy_complete", Some("k1"), 1)).unwrap();

        let recent = logger.recent_activity(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "copy_complete");
        assert_eq!(recent[1].key.as_deref(), Some("k1"));
    }

    #[test]
    fn reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sqlite3");
        SqliteLogger::open(&path)
            .unwrap()
            .log_activity(&row("2026-10-01T00:00:00.000Z", "sync_start", None, 1))
            .unwrap();
        assert_eq!(SqliteLogger::open(&path).unwrap().recent_activity(5).unwrap().len(), 1);
    }
}
