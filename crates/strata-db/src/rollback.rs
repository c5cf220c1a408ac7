//! Logical rollback: marks applied migrations as ROLLED_BACK.
//!
//! No down-scripts exist, so nothing is executed against the schema; only
//! the history table changes.

use serde::Serialize;
use strata_common::{Error, Result};
use tracing::{info, warn};

use crate::database::Database;
use crate::history::{HistoryRecord, HistoryStore, MigrationStatus};
use crate::registry::{Registry, is_bootstrap_version};

/// Which SUCCESS records to roll back, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// The newest `n` records.
    Steps(usize),
    /// Every record with a version strictly greater than this one.
    ToVersion(String),
}

impl RollbackTarget {
    /// Build a target from the two mutually exclusive flags. Neither means one step.
    pub fn from_flags(steps: Option<usize>, to_version: Option<String>) -> Result<Self> {
        match (steps, to_version) {
            (Some(_), Some(_)) => Err(Error::Usage(
                "--steps and --to are mutually exclusive".into(),
            )),
            (Some(0), None) => Err(Error::Usage("--steps must be at least 1".into())),
            (Some(n), None) => Ok(Self::Steps(n)),
            (None, Some(version)) if version.trim().is_empty() => {
                Err(Error::Usage("--to requires a version".into()))
            }
            (None, Some(version)) => Ok(Self::ToVersion(version)),
            (None, None) => Ok(Self::Steps(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// Records that were (or, if cancelled, would have been) rolled back, newest first.
    pub selected: Vec<HistoryRecord>,
    pub rolled_back: Vec<String>,
    pub cancelled: bool,
}

pub struct RollbackManager<'a> {
    db: &'a Database,
    registry: &'a Registry,
    history: &'a HistoryStore,
}

impl<'a> RollbackManager<'a> {
    pub fn new(db: &'a Database, registry: &'a Registry, history: &'a HistoryStore) -> Self {
        Self {
            db,
            registry,
            history,
        }
    }

    /// Records `target` would select, newest first. Read-only.
    pub fn plan(&self, target: &RollbackTarget) -> Result<Vec<HistoryRecord>> {
        self.validate(target)?;

        let conn = self.db.acquire()?;
        let mut applied: Vec<HistoryRecord> = self
            .history
            .read_all(&conn)?
            .into_iter()
            .filter(|r| r.status == MigrationStatus::Success)
            .collect();
        applied.sort_by(|a, b| b.version.cmp(&a.version));

        Ok(match target {
            RollbackTarget::Steps(n) => applied.into_iter().take(*n).collect(),
            RollbackTarget::ToVersion(floor) => applied
                .into_iter()
                .take_while(|r| r.version > *floor)
                .collect(),
        })
    }

    /// Mark the selected records ROLLED_BACK once `confirm` approves them.
    ///
    /// `confirm` is only consulted when something would change. All records
    /// flip in one transaction.
    pub fn rollback(
        &self,
        target: &RollbackTarget,
        confirm: impl FnOnce(&[HistoryRecord]) -> bool,
    ) -> Result<RollbackReport> {
        let selected = self.plan(target)?;
        if selected.is_empty() {
            info!("nothing to roll back");
            return Ok(RollbackReport::default());
        }

        if !confirm(&selected) {
            info!(count = selected.len(), "rollback cancelled");
            return Ok(RollbackReport {
                selected,
                rolled_back: Vec::new(),
                cancelled: true,
            });
        }

        let conn = self.db.acquire()?;
        let tx = self.db.begin(&conn)?;
        let mut rolled_back = Vec::with_capacity(selected.len());
        for record in &selected {
            if !self.history.mark_rolled_back(&tx, &record.version)? {
                return Err(Error::History(format!(
                    "migration {} is no longer marked SUCCESS; rollback aborted",
                    record.version
                )));
            }
            info!(version = %record.version, name = %record.name, "marked rolled back");
            rolled_back.push(record.version.clone());
        }
        tx.commit()
            .map_err(|e| Error::History(format!("failed to commit rollback: {e}")))?;

        warn!(
            count = rolled_back.len(),
            "rollback is bookkeeping only; the physical schema is unchanged"
        );
        Ok(RollbackReport {
            selected,
            rolled_back,
            cancelled: false,
        })
    }

    fn validate(&self, target: &RollbackTarget) -> Result<()> {
        let RollbackTarget::ToVersion(version) = target else {
            return Ok(());
        };
        if is_bootstrap_version(version) {
            return Ok(());
        }
        let known = self.registry.list()?.iter().any(|m| &m.version == version);
        if !known {
            return Err(Error::Usage(format!("unknown target version {version}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_mutually_exclusive() {
        let err = RollbackTarget::from_flags(Some(2), Some("001".into())).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn flags_default_to_one_step() {
        assert_eq!(RollbackTarget::from_flags(None, None).unwrap(), RollbackTarget::Steps(1));
        assert_eq!(
            RollbackTarget::from_flags(Some(3), None).unwrap(),
            RollbackTarget::Steps(3)
        );
        assert_eq!(
            RollbackTarget::from_flags(None, Some("002".into())).unwrap(),
            RollbackTarget::ToVersion("002".into())
        );
    }

    #[test]
    fn zero_steps_and_blank_version_are_rejected() {
        assert!(RollbackTarget::from_flags(Some(0), None).is_err());
        assert!(RollbackTarget::from_flags(None, Some(" ".into())).is_err());
    }
}
