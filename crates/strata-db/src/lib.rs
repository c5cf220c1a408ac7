pub mod database;
pub mod executor;
pub mod history;
pub mod registry;
pub mod retry;
pub mod rollback;
pub mod scaffold;
pub mod status;
pub mod verifier;

pub use database::{Database, DatabaseTarget};
pub use executor::{AppliedMigration, Executor, PlannedMigration, RunOptions, RunReport};
pub use history::{HistoryRecord, HistoryStore, MigrationStatus};
pub use registry::{Migration, Registry};
pub use retry::{Retry, RetryPolicy, Retryable};
pub use rollback::{RollbackManager, RollbackReport, RollbackTarget};
pub use scaffold::create_migration;
pub use status::{MigrationState, StatusEntry, StatusReport, StatusReporter};
pub use verifier::{Drift, short_checksum, verify, verify_database};
