use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::retry::{Retry, RetryPolicy};

/// Where a connection string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Memory,
    File(PathBuf),
}

impl DatabaseTarget {
    /// Parse `sqlite://path`, `sqlite:path`, a plain path, `:memory:` or `sqlite::memory:`.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let rest = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);

        match rest {
            "" => Err(Error::Config("database url is empty".into())),
            ":memory:" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

/// An explicitly constructed handle to the target database.
///
/// The connection lives behind a mutex; [`Database::acquire`] hands out a
/// guard that releases it when dropped, whichever way the caller exits.
pub struct Database {
    conn: Mutex<Connection>,
    retry: Retry,
}

impl Database {
    /// Connect using a connection string, retrying transient open failures.
    pub fn connect(url: &str, retry: Retry) -> Result<Self> {
        let target = DatabaseTarget::parse(url)?;
        let conn = retry
            .run("opening database", || open_connection(&target, false))
            .map_err(|e| Error::Connection(format!("failed to open database {url}: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    /// Connect without the ability to write. A database file that does not
    /// exist yet is not created; an empty in-memory schema stands in for it.
    pub fn connect_read_only(url: &str, retry: Retry) -> Result<Self> {
        let target = match DatabaseTarget::parse(url)? {
            DatabaseTarget::File(path) if !path.exists() => {
                info!("{} does not exist yet; reading an empty schema", path.display());
                DatabaseTarget::Memory
            }
            target => target,
        };
        let conn = retry
            .run("opening database", || open_connection(&target, true))
            .map_err(|e| Error::Connection(format!("failed to open database {url}: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        Self::connect(&db_path.to_string_lossy(), Retry::default())
    }

    pub fn in_memory() -> Result<Self> {
        Self::connect(":memory:", Retry::new(RetryPolicy::no_retry()))
    }

    /// Exclusive access to the connection for the lifetime of the guard.
    pub fn acquire(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Connection("database connection lock poisoned".into()))
    }

    /// Start a write transaction on `conn`, retrying while the database is busy.
    ///
    /// The returned transaction rolls back when dropped without a commit.
    pub fn begin<'c>(&self, conn: &'c Connection) -> Result<Transaction<'c>> {
        self.retry
            .run("starting transaction", move || {
                Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            })
            .map_err(|e| Error::Connection(format!("failed to start transaction: {e}")))
    }
}

fn open_connection(target: &DatabaseTarget, read_only: bool) -> rusqlite::Result<Connection> {
    let conn = match target {
        DatabaseTarget::Memory => Connection::open_in_memory()?,
        DatabaseTarget::File(path) if read_only => {
            info!("opening database read-only at {}", path.display());
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        }
        DatabaseTarget::File(path) => {
            info!("opening database at {}", path.display());
            Connection::open(path)?
        }
    };

    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    // Opening is lazy in SQLite; touch the schema so an unreadable file fails here.
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
    debug!("database connection ready");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connection_strings() {
        assert_eq!(DatabaseTarget::parse(":memory:").unwrap(), DatabaseTarget::Memory);
        assert_eq!(
            DatabaseTarget::parse("sqlite::memory:").unwrap(),
            DatabaseTarget::Memory
        );
        assert_eq!(
            DatabaseTarget::parse("sqlite://data/app.db").unwrap(),
            DatabaseTarget::File(PathBuf::from("data/app.db"))
        );
        assert_eq!(
            DatabaseTarget::parse("sqlite:app.db").unwrap(),
            DatabaseTarget::File(PathBuf::from("app.db"))
        );
        assert_eq!(
            DatabaseTarget::parse("/var/lib/app.db").unwrap(),
            DatabaseTarget::File(PathBuf::from("/var/lib/app.db"))
        );
        assert!(DatabaseTarget::parse("  ").is_err());
    }

    #[test]
    fn opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("app.db")).unwrap();
        let conn = db.acquire().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
    }

    #[test]
    fn unreachable_database_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/app.db");
        let retry = Retry::new(RetryPolicy::default()).with_sleeper(|_| {});
        let err = Database::connect(&missing.to_string_lossy(), retry)
            .err()
            .expect("opening in a missing directory should fail");
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn read_only_connect_does_not_create_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");
        let db = Database::connect_read_only(&path.to_string_lossy(), Retry::default()).unwrap();
        let tables: i64 = db
            .acquire()
            .unwrap()
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
        assert!(!path.exists());
    }

    #[test]
    fn read_only_connect_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        {
            let writer = Database::open(&path).unwrap();
            let conn = writer.acquire().unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        }

        let db = Database::connect_read_only(&path.to_string_lossy(), Retry::default()).unwrap();
        let conn = db.acquire().unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(conn.execute_batch("INSERT INTO t VALUES (1)").is_err());
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let db = Database::in_memory().unwrap();
        let conn = db.acquire().unwrap();
        {
            let tx = db.begin(&conn).unwrap();
            tx.execute_batch("CREATE TABLE scratch (id INTEGER)").unwrap();
        }
        let exists: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'scratch'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);
    }

    #[test]
    fn committed_transaction_persists() {
        let db = Database::in_memory().unwrap();
        let conn = db.acquire().unwrap();
        let tx = db.begin(&conn).unwrap();
        tx.execute_batch("CREATE TABLE kept (id INTEGER)").unwrap();
        tx.commit().unwrap();
        let exists: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'kept'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 1);
    }
}
