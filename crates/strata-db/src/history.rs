use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result, is_sql_identifier};
use tracing::info;

/// Outcome recorded for a migration version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Success,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// Whether a record may move from `from` to `self`.
    ///
    /// `forced` marks an explicit re-apply, the only way back to SUCCESS from
    /// ROLLED_BACK. Nothing ever moves from FAILED to ROLLED_BACK.
    pub fn reachable_from(self, from: Option<MigrationStatus>, forced: bool) -> bool {
        use MigrationStatus::*;
        match (from, self) {
            (None, Success | Failed) => true,
            (None, RolledBack) => false,
            (Some(Failed), Success | Failed) => true,
            (Some(Success), RolledBack) => true,
            (Some(Success), Success | Failed) => forced,
            (Some(RolledBack), Success | Failed) => forced,
            (Some(Failed | RolledBack), RolledBack) => false,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            other => Err(Error::History(format!("unknown migration status {other:?}"))),
        }
    }
}

/// One row of the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub status: MigrationStatus,
    pub execution_time_ms: i64,
    pub applied_at: DateTime<Utc>,
}

/// Typed access to the history table.
///
/// The store is scoped to a table name and operates on whatever connection
/// it is handed, so writes can join a migration's own transaction.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    table: String,
}

impl HistoryStore {
    /// `table` must be a plain identifier; it is interpolated into SQL.
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_sql_identifier(&table) {
            return Err(Error::Config(format!(
                "invalid history table name {table:?}"
            )));
        }
        Ok(Self { table })
    }

    /// Create the history table if absent. This is the bootstrap step and is
    /// never recorded in the table itself.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        if self.exists(conn)? {
            return Ok(());
        }
        info!(table = %self.table, "creating history table");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                version TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL CHECK (status IN ('SUCCESS', 'FAILED', 'ROLLED_BACK')),
                applied_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status, version);",
            table = self.table
        ))
        .map_err(|e| Error::History(format!("failed to create history table: {e}")))?;
        Ok(())
    }

    pub fn exists(&self, conn: &Connection) -> Result<bool> {
        conn.query_row(
            "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![self.table],
            |row| row.get(0),
        )
        .map_err(|e| Error::History(format!("failed to inspect schema: {e}")))
    }

    /// Versions with status SUCCESS, keyed by version.
    pub fn applied_versions(&self, conn: &Connection) -> Result<BTreeMap<String, HistoryRecord>> {
        let records = self.query(
            conn,
            &format!(
                "SELECT version, name, checksum, status, execution_time_ms, applied_at
                 FROM {} WHERE status = 'SUCCESS' ORDER BY version ASC",
                self.table
            ),
        )?;
        Ok(records.into_iter().map(|r| (r.version.clone(), r)).collect())
    }

    /// Every record, ascending by version.
    pub fn all_records(&self, conn: &Connection) -> Result<Vec<HistoryRecord>> {
        self.query(
            conn,
            &format!(
                "SELECT version, name, checksum, status, execution_time_ms, applied_at
                 FROM {} ORDER BY version ASC",
                self.table
            ),
        )
    }

    /// Like [`all_records`](Self::all_records), but empty when the table has
    /// not been created yet. Never creates it.
    pub fn read_all(&self, conn: &Connection) -> Result<Vec<HistoryRecord>> {
        if self.exists(conn)? {
            self.all_records(conn)
        } else {
            Ok(Vec::new())
        }
    }

    pub fn get(&self, conn: &Connection, version: &str) -> Result<Option<HistoryRecord>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT version, name, checksum, status, execution_time_ms, applied_at
                 FROM {} WHERE version = ?1",
                self.table
            ))
            .map_err(|e| Error::History(format!("failed to prepare query: {e}")))?;

        let raw = stmt
            .query_row(params![version], RawRecord::from_row)
            .optional()
            .map_err(|e| Error::History(format!("failed to read history record: {e}")))?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Insert or update the row for `record.version`.
    pub fn upsert(&self, conn: &Connection, record: &HistoryRecord) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, checksum, status, execution_time_ms, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(version) DO UPDATE SET
                    name = excluded.name,
                    checksum = excluded.checksum,
                    status = excluded.status,
                    execution_time_ms = excluded.execution_time_ms,
                    applied_at = excluded.applied_at",
                self.table
            ),
            params![
                record.version,
                record.name,
                record.checksum,
                record.status.as_str(),
                record.execution_time_ms,
                record.applied_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            Error::History(format!(
                "failed to record migration {} as {}: {e}",
                record.version, record.status
            ))
        })?;
        Ok(())
    }

    /// Flip a SUCCESS record to ROLLED_BACK, leaving checksum and timing alone.
    /// Returns false if there was no SUCCESS record for `version`.
    pub fn mark_rolled_back(&self, conn: &Connection, version: &str) -> Result<bool> {
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET status = 'ROLLED_BACK' WHERE version = ?1 AND status = 'SUCCESS'",
                    self.table
                ),
                params![version],
            )
            .map_err(|e| {
                Error::History(format!("failed to mark {version} as rolled back: {e}"))
            })?;
        Ok(changed == 1)
    }

    fn query(&self, conn: &Connection, sql: &str) -> Result<Vec<HistoryRecord>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::History(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], RawRecord::from_row)
            .map_err(|e| Error::History(format!("failed to query history: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let raw =
                row.map_err(|e| Error::History(format!("failed to read history row: {e}")))?;
            records.push(raw.into_record()?);
        }
        Ok(records)
    }
}

/// Row as stored, before status and timestamp are validated.
struct RawRecord {
    version: String,
    name: String,
    checksum: String,
    status: String,
    execution_time_ms: i64,
    applied_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version: row.get(0)?,
            name: row.get(1)?,
            checksum: row.get(2)?,
            status: row.get(3)?,
            execution_time_ms: row.get(4)?,
            applied_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<HistoryRecord> {
        Ok(HistoryRecord {
            status: self.status.parse()?,
            applied_at: parse_datetime(&self.applied_at)?,
            version: self.version,
            name: self.name,
            checksum: self.checksum,
            execution_time_ms: self.execution_time_ms,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by hand through datetime('now') use "YYYY-MM-DD HH:MM:SS".
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|e| Error::History(format!("invalid applied_at timestamp {s:?}: {e}")))
}
