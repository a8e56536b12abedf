//! SQLite store for analysis results.
//!
//! One WAL-mode database per diagnosis home. Every row carries the
//! inspection id so several runs can share the file.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};

use crate::analyzer::slow_query::SlowQueryRecord;
use crate::core::errors::{DiagError, Result};
use crate::values::tagged::TaggedFloat;

/// Analysis database handle.
pub struct AnalysisSink {
    conn: Connection,
    path: PathBuf,
}

/// A row of `inspection_slow_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowLogRow {
    pub inspection: String,
    pub instance: String,
    pub node_ip: String,
    /// RFC3339 in the record's own offset.
    pub time: String,
    pub txn_start_ts: i64,
    pub user: String,
    pub conn_id: i64,
    /// Tagged with instance and digest; persisted in text form.
    pub query_time: TaggedFloat,
    pub db: String,
    pub digest: String,
    pub query: String,
}

impl SlowLogRow {
    pub fn from_record(inspection: &str, instance: &str, node_ip: &str, rec: &SlowQueryRecord) -> Self {
        Self {
            inspection: inspection.to_string(),
            instance: instance.to_string(),
            node_ip: node_ip.to_string(),
            time: rec.time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            txn_start_ts: i64::try_from(rec.txn_start_ts).unwrap_or(i64::MAX),
            user: rec.user.clone(),
            conn_id: i64::try_from(rec.conn_id).unwrap_or(i64::MAX),
            query_time: TaggedFloat::new(
                rec.query_time,
                [("instance", instance), ("digest", rec.digest.as_str())],
            ),
            db: rec.db.clone(),
            digest: rec.digest.clone(),
            query: rec.sql.clone(),
        }
    }
}

/// A row of `inspection_log_level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelCountRow {
    pub inspection: String,
    pub host: String,
    pub component: String,
    pub port: String,
    pub level: String,
    pub count: i64,
}

impl AnalysisSink {
    /// Open (or create) the database at `path`.
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

    // ──────────────────── inspection_slow_log ────────────────────

    /// Replace the slow log rows of `inspection` in one transaction.
    /// Returns the number written.
    pub fn replace_slow_logs(&mut self, inspection: &str, rows: &[SlowLogRow]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            tx.prepare_cached("DELETE FROM inspection_slow_log WHERE inspection = ?1")?
                .execute(params![inspection])?;
            let mut stmt = tx.prepare_cached(
                "INSERT INTO inspection_slow_log (
                    inspection, instance, node_ip, time, txn_start_ts, user,
                    conn_id, query_time, db, digest, query
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.inspection,
                    row.instance,
                    row.node_ip,
                    row.time,
                    row.txn_start_ts,
                    row.user,
                    row.conn_id,
                    row.query_time,
                    row.db,
                    row.digest,
                    row.query,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Slow log rows of one inspection, oldest first.
    pub fn slow_logs(&self, inspection: &str) -> Result<Vec<SlowLogRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT inspection, instance, node_ip, time, txn_start_ts, user,
                    conn_id, query_time, db, digest, query
             FROM inspection_slow_log WHERE inspection = ?1 ORDER BY time, id",
        )?;
        let rows = stmt
            .query_map(params![inspection], |row| {
                Ok(SlowLogRow {
                    inspection: row.get(0)?,
                    instance: row.get(1)?,
                    node_ip: row.get(2)?,
                    time: row.get(3)?,
                    txn_start_ts: row.get(4)?,
                    user: row.get(5)?,
                    conn_id: row.get(6)?,
                    query_time: row.get(7)?,
                    db: row.get(8)?,
                    digest: row.get(9)?,
                    query: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── inspection_log_level ────────────────────

    pub fn replace_level_counts(&mut self, inspection: &str, rows: &[LevelCountRow]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            tx.prepare_cached("DELETE FROM inspection_log_level WHERE inspection = ?1")?
                .execute(params![inspection])?;
            let mut stmt = tx.prepare_cached(
                "INSERT INTO inspection_log_level (
                    inspection, host, component, port, level, count
                ) VALUES (?1,?2,?3,?4,?5,?6)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.inspection,
                    row.host,
                    row.component,
                    row.port,
                    row.level,
                    row.count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn level_counts(&self, inspection: &str) -> Result<Vec<LevelCountRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT inspection, host, component, port, level, count
             FROM inspection_log_level WHERE inspection = ?1
             ORDER BY host, component, port, level",
        )?;
        let rows = stmt
            .query_map(params![inspection], |row| {
                Ok(LevelCountRow {
                    inspection: row.get(0)?,
                    host: row.get(1)?,
                    component: row.get(2)?,
                    port: row.get(3)?,
                    level: row.get(4)?,
                    count: row.get(5)?,
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
        "CREATE TABLE IF NOT EXISTS inspection_slow_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            inspection TEXT NOT NULL,
            instance TEXT NOT NULL,
            node_ip TEXT NOT NULL,
            time TEXT NOT NULL,
            txn_start_ts INTEGER NOT NULL,
            user TEXT NOT NULL,
            conn_id INTEGER NOT NULL,
            query_time TEXT NOT NULL,
            db TEXT NOT NULL,
            digest TEXT NOT NULL,
            query TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS inspection_log_level (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            inspection TEXT NOT NULL,
            host TEXT NOT NULL,
            component TEXT NOT NULL,
            port TEXT NOT NULL,
            level TEXT NOT NULL,
            count INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_slow_log_inspection ON inspection_slow_log(inspection);
        CREATE INDEX IF NOT EXISTS idx_log_level_inspection ON inspection_log_level(inspection);",
    )?;
    Ok(())
}
