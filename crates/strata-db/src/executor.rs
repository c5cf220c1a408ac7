//! Applies pending migrations in ascending version order.
//!
//! Each migration runs in its own transaction together with its SUCCESS
//! history row, so a crash can never leave a committed schema change without
//! a record. The first failure stops the run; versions committed before it
//! stay committed.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use strata_common::{Error, Result};
use tracing::{error, info, warn};

use crate::database::Database;
use crate::history::{HistoryRecord, HistoryStore, MigrationStatus};
use crate::registry::{Migration, Registry};
use crate::verifier::{self, Drift};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Report what would run without touching the database.
    pub dry_run: bool,
    /// Re-apply versions that already succeeded (or were rolled back).
    pub force: bool,
    /// Inclusive ceiling; must name a known version.
    pub target_version: Option<String>,
}

/// A migration selected for execution, as shown in a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedMigration {
    pub version: String,
    pub name: String,
    pub transactional: bool,
    pub script: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub version: String,
    pub name: String,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    /// Candidates in apply order. For a dry run this is the whole preview.
    pub planned: Vec<PlannedMigration>,
    pub applied: Vec<AppliedMigration>,
    /// Versions within the ceiling skipped because they already succeeded.
    pub skipped: usize,
    /// ROLLED_BACK versions left alone because the run was not forced.
    pub held_back: Vec<String>,
    pub drift: Vec<Drift>,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.planned.is_empty()
    }
}

/// Runs migrations from a [`Registry`] against a [`Database`].
pub struct Executor<'a> {
    db: &'a Database,
    registry: &'a Registry,
    history: &'a HistoryStore,
}

impl<'a> Executor<'a> {
    pub fn new(db: &'a Database, registry: &'a Registry, history: &'a HistoryStore) -> Self {
        Self {
            db,
            registry,
            history,
        }
    }

    pub fn run(&self, options: &RunOptions) -> Result<RunReport> {
        // Discovery and flag validation happen before the database is touched.
        let migrations = self.registry.list()?;
        if let Some(target) = &options.target_version {
            if !migrations.iter().any(|m| &m.version == target) {
                return Err(Error::Usage(format!("unknown target version {target}")));
            }
        }

        let conn = self.db.acquire()?;
        // A dry run reads history only if it is already there.
        let has_history = if options.dry_run {
            self.history.exists(&conn)?
        } else {
            self.history.ensure_schema(&conn)?;
            true
        };
        let (applied, records) = if has_history {
            let records: BTreeMap<String, HistoryRecord> = self
                .history
                .all_records(&conn)?
                .into_iter()
                .map(|r| (r.version.clone(), r))
                .collect();
            (self.history.applied_versions(&conn)?, records)
        } else {
            (BTreeMap::new(), BTreeMap::new())
        };

        let mut report = RunReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        if !options.force {
            report.drift = verifier::verify(&migrations, applied.values());
            verifier::log_drift(&report.drift);
        }

        let mut candidates = Vec::new();
        for migration in &migrations {
            if options
                .target_version
                .as_ref()
                .is_some_and(|target| migration.version > *target)
            {
                break;
            }
            if options.force {
                candidates.push(migration);
            } else if applied.contains_key(&migration.version) {
                report.skipped += 1;
            } else if records
                .get(&migration.version)
                .is_some_and(|r| r.status == MigrationStatus::RolledBack)
            {
                warn!(
                    version = %migration.version,
                    "migration is marked rolled back; re-apply it with --force"
                );
                report.held_back.push(migration.version.clone());
            } else {
                candidates.push(migration);
            }
        }

        // Applying anything above a held-back version would run migrations out of order.
        if let Some(held) = report.held_back.first() {
            if let Some(later) = candidates.iter().find(|m| m.version > *held) {
                return Err(Error::Usage(format!(
                    "migration {held} is marked rolled back but newer migration {} is pending; \
                     re-apply {held} with --force or pass --target below {held}",
                    later.version
                )));
            }
        }

        report.planned = candidates
            .iter()
            .map(|m| PlannedMigration {
                version: m.version.clone(),
                name: m.name.clone(),
                transactional: m.is_transactional(),
                script: m.script.clone(),
            })
            .collect();

        if candidates.is_empty() {
            info!(skipped = report.skipped, "database is up to date");
            return Ok(report);
        }

        if options.dry_run {
            for m in &candidates {
                info!(version = %m.version, name = %m.name, "dry run: would apply");
            }
            return Ok(report);
        }

        for migration in candidates {
            let previous = records.get(&migration.version).map(|r| r.status);
            debug_assert!(MigrationStatus::Success.reachable_from(previous, options.force));

            info!(version = %migration.version, name = %migration.name, "applying migration");
            let started = Instant::now();
            match self.apply(&conn, migration, &started) {
                Ok(execution_time_ms) => {
                    info!(
                        version = %migration.version,
                        execution_time_ms,
                        "migration applied"
                    );
                    report.applied.push(AppliedMigration {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        execution_time_ms,
                    });
                }
                Err(Failure::Script(reason)) => {
                    self.record_failure(&conn, migration, elapsed_ms(&started));
                    error!(version = %migration.version, "migration failed: {reason}");
                    return Err(Error::Execution {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        reason,
                        applied: report.applied.iter().map(|a| a.version.clone()).collect(),
                    });
                }
                Err(Failure::Infrastructure(err)) => {
                    error!(version = %migration.version, "migration aborted: {err}");
                    return Err(err);
                }
            }
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped,
            "migration run complete"
        );
        Ok(report)
    }

    /// Apply one migration and record it. Returns the measured duration.
    fn apply(&self, conn: &Connection, migration: &Migration, started: &Instant) -> std::result::Result<i64, Failure> {
        if !migration.is_transactional() {
            warn!(
                version = %migration.version,
                "running outside a transaction; a failure may leave partial changes"
            );
            conn.execute_batch(&migration.script)
                .map_err(|e| Failure::Script(e.to_string()))?;
            let elapsed = elapsed_ms(started);
            self.history
                .upsert(conn, &success_record(migration, elapsed))
                .map_err(Failure::Infrastructure)?;
            return Ok(elapsed);
        }

        let tx = self.db.begin(conn).map_err(Failure::Infrastructure)?;
        if let Err(e) = tx.execute_batch(&migration.script) {
            if let Err(rollback_err) = tx.rollback() {
                warn!(version = %migration.version, "rollback after failure also failed: {rollback_err}");
            }
            return Err(Failure::Script(e.to_string()));
        }

        let elapsed = elapsed_ms(started);
        // Dropping `tx` on error rolls the script back with the record.
        self.history
            .upsert(&tx, &success_record(migration, elapsed))
            .map_err(Failure::Infrastructure)?;
        tx.commit()
            .map_err(|e| Failure::Script(format!("commit failed: {e}")))?;
        Ok(elapsed)
    }

    /// Best effort: a failure here is logged and never replaces the script error.
    fn record_failure(&self, conn: &Connection, migration: &Migration, execution_time_ms: i64) {
        let record = HistoryRecord {
            version: migration.version.clone(),
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            status: MigrationStatus::Failed,
            execution_time_ms,
            applied_at: Utc::now(),
        };
        if let Err(e) = self.history.upsert(conn, &record) {
            error!(version = %migration.version, "could not record failed migration: {e}");
        }
    }
}

enum Failure {
    /// The script (or its commit) was rejected by the database.
    Script(String),
    /// Something around the script failed: connection, lock, history write.
    Infrastructure(Error),
}

fn success_record(migration: &Migration, execution_time_ms: i64) -> HistoryRecord {
    HistoryRecord {
        version: migration.version.clone(),
        name: migration.name.clone(),
        checksum: migration.checksum.clone(),
        status: MigrationStatus::Success,
        execution_time_ms,
        applied_at: Utc::now(),
    }
}

fn elapsed_ms(started: &Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
