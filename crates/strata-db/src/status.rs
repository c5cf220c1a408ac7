use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_common::Result;

use crate::database::Database;
use crate::history::{HistoryRecord, HistoryStore, MigrationStatus};
use crate::registry::{Migration, Registry};
use crate::verifier::{self, Drift};

/// Where a registry version stands. Only `Applied` counts as applied; the
/// other three are all pending from the executor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Applied,
    Pending,
    Failed,
    RolledBack,
}

impl MigrationState {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub version: String,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub drifted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    /// History rows whose migration file is gone.
    pub orphaned: Vec<HistoryRecord>,
    pub drift: Vec<Drift>,
    pub applied_count: usize,
    pub pending_count: usize,
    pub failed_count: usize,
    pub rolled_back_count: usize,
}

impl StatusReport {
    /// Combine registry and history into a report. Pure.
    pub fn build(migrations: &[Migration], records: &[HistoryRecord]) -> Self {
        let by_version: HashMap<&str, &HistoryRecord> =
            records.iter().map(|r| (r.version.as_str(), r)).collect();
        let drift = verifier::verify(migrations, records);

        let mut report = StatusReport::default();
        for migration in migrations {
            let record = by_version.get(migration.version.as_str()).copied();
            let state = match record.map(|r| r.status) {
                Some(MigrationStatus::Success) => MigrationState::Applied,
                Some(MigrationStatus::Failed) => MigrationState::Failed,
                Some(MigrationStatus::RolledBack) => MigrationState::RolledBack,
                None => MigrationState::Pending,
            };
            match state {
                MigrationState::Applied => report.applied_count += 1,
                MigrationState::Failed => report.failed_count += 1,
                MigrationState::RolledBack => report.rolled_back_count += 1,
                MigrationState::Pending => {}
            }
            if !state.is_applied() {
                report.pending_count += 1;
            }

            report.entries.push(StatusEntry {
                version: migration.version.clone(),
                name: migration.name.clone(),
                state,
                applied_at: record.map(|r| r.applied_at),
                execution_time_ms: record.map(|r| r.execution_time_ms),
                drifted: drift.iter().any(|d| d.version == migration.version),
            });
        }

        report.orphaned = records
            .iter()
            .filter(|r| !migrations.iter().any(|m| m.version == r.version))
            .cloned()
            .collect();
        report.drift = drift;
        report
    }

    pub fn applied(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries.iter().filter(|e| e.state.is_applied())
    }

    pub fn pending(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries.iter().filter(|e| !e.state.is_applied())
    }
}

/// Read-only operator view over registry and history.
pub struct StatusReporter<'a> {
    db: &'a Database,
    registry: &'a Registry,
    history: &'a HistoryStore,
}

impl<'a> StatusReporter<'a> {
    pub fn new(db: &'a Database, registry: &'a Registry, history: &'a HistoryStore) -> Self {
        Self {
            db,
            registry,
            history,
        }
    }

    pub fn report(&self) -> Result<StatusReport> {
        let migrations = self.registry.list()?;
        let conn = self.db.acquire()?;
        let records = self.history.read_all(&conn)?;
        Ok(StatusReport::build(&migrations, &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, checksum: &str, status: MigrationStatus) -> HistoryRecord {
        HistoryRecord {
            version: version.into(),
            name: "x".into(),
            checksum: checksum.into(),
            status,
            execution_time_ms: 3,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn partitions_versions_and_counts() {
        let migrations = vec![
            Migration::new("001", "init", "SELECT 1;"),
            Migration::new("002", "add_col", "SELECT 2;"),
            Migration::new("003", "add_index", "SELECT 3;"),
            Migration::new("004", "seed", "SELECT 4;"),
        ];
        let records = vec![
            record("001", &migrations[0].checksum, MigrationStatus::Success),
            record("002", "edited", MigrationStatus::Success),
            record("003", &migrations[2].checksum, MigrationStatus::RolledBack),
            record("007", "gone", MigrationStatus::Success),
        ];

        let report = StatusReport::build(&migrations, &records);
        let states: Vec<_> = report.entries.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            [
                MigrationState::Applied,
                MigrationState::Applied,
                MigrationState::RolledBack,
                MigrationState::Pending
            ]
        );
        assert_eq!(report.applied_count, 2);
        assert_eq!(report.pending_count, 2);
        assert_eq!(report.rolled_back_count, 1);
        assert_eq!(report.applied().count(), 2);
        assert_eq!(report.pending().map(|e| e.version.as_str()).collect::<Vec<_>>(), ["003", "004"]);
        assert!(report.entries[1].drifted);
        assert!(!report.entries[0].drifted);
        assert_eq!(report.drift.len(), 1);
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].version, "007");
    }

    #[test]
    fn empty_history_means_everything_pending() {
        let migrations = vec![Migration::new("001", "init", "SELECT 1;")];
        let report = StatusReport::build(&migrations, &[]);
        assert_eq!(report.pending_count, 1);
        assert_eq!(report.applied_count, 0);
        assert!(report.entries[0].applied_at.is_none());
    }
}
