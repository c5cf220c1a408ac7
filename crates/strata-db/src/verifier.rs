//! Checksum drift detection between migration files and recorded history.

use std::collections::HashMap;

use serde::Serialize;
use strata_common::Result;
use tracing::warn;

use crate::database::Database;
use crate::history::{HistoryRecord, HistoryStore, MigrationStatus};
use crate::registry::{Migration, Registry};

/// A migration whose file no longer matches the checksum recorded when it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub version: String,
    pub name: String,
    pub recorded_checksum: String,
    pub current_checksum: String,
    pub status: MigrationStatus,
}

/// Compare every version present in both inputs, ignoring ROLLED_BACK records.
/// Pure: no I/O, no logging.
pub fn verify<'a>(
    migrations: &[Migration],
    records: impl IntoIterator<Item = &'a HistoryRecord>,
) -> Vec<Drift> {
    let current: HashMap<&str, &Migration> =
        migrations.iter().map(|m| (m.version.as_str(), m)).collect();

    let mut drift: Vec<Drift> = records
        .into_iter()
        .filter(|r| r.status != MigrationStatus::RolledBack)
        .filter_map(|record| {
            let migration = current.get(record.version.as_str())?;
            (migration.checksum != record.checksum).then(|| Drift {
                version: record.version.clone(),
                name: migration.name.clone(),
                recorded_checksum: record.checksum.clone(),
                current_checksum: migration.checksum.clone(),
                status: record.status,
            })
        })
        .collect();
    drift.sort_by(|a, b| a.version.cmp(&b.version));
    drift
}

/// Emit one warning per drifted migration.
pub fn log_drift(drift: &[Drift]) {
    for d in drift {
        warn!(
            version = %d.version,
            name = %d.name,
            recorded = %short_checksum(&d.recorded_checksum),
            current = %short_checksum(&d.current_checksum),
            "migration file changed after it was applied; use --force to re-apply it"
        );
    }
}

/// Read-only drift check against the live database.
pub fn verify_database(db: &Database, registry: &Registry, history: &HistoryStore) -> Result<Vec<Drift>> {
    let migrations = registry.list()?;
    let conn = db.acquire()?;
    let records = history.read_all(&conn)?;
    Ok(verify(&migrations, &records))
}

/// First 12 hex digits, enough to tell checksums apart in logs.
pub fn short_checksum(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(m: &Migration, checksum: &str, status: MigrationStatus) -> HistoryRecord {
        HistoryRecord {
            version: m.version.clone(),
            name: m.name.clone(),
            checksum: checksum.to_string(),
            status,
            execution_time_ms: 1,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn matching_checksums_produce_no_drift() {
        let m = Migration::new("001", "init", "CREATE TABLE t (id INTEGER);");
        let records = vec![record(&m, &m.checksum, MigrationStatus::Success)];
        assert!(verify(&[m], &records).is_empty());
    }

    #[test]
    fn changed_script_is_reported() {
        let m = Migration::new("001", "init", "CREATE TABLE t (id INTEGER, extra TEXT);");
        let records = vec![record(&m, "stale", MigrationStatus::Success)];
        let drift = verify(std::slice::from_ref(&m), &records);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].version, "001");
        assert_eq!(drift[0].recorded_checksum, "stale");
        assert_eq!(drift[0].current_checksum, m.checksum);
    }

    #[test]
    fn rolled_back_and_unmatched_versions_are_ignored() {
        let a = Migration::new("001", "a", "SELECT 1;");
        let b = Migration::new("002", "b", "SELECT 2;");
        let orphan = HistoryRecord {
            version: "009".into(),
            ..record(&a, "whatever", MigrationStatus::Success)
        };
        let records = vec![
            record(&a, "stale", MigrationStatus::RolledBack),
            record(&b, "stale", MigrationStatus::Failed),
            orphan,
        ];
        let drift = verify(&[a, b], &records);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].version, "002");
        assert_eq!(drift[0].status, MigrationStatus::Failed);
    }

    #[test]
    fn short_checksum_handles_short_input() {
        assert_eq!(short_checksum("abc"), "abc");
        assert_eq!(short_checksum("0123456789abcdef"), "0123456789ab");
    }
}
