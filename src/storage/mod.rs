//! SQLite storage for dipwatch
//!
//! One `Database` handle per storage target, shared across threads through an
//! `Arc<Mutex<Connection>>`. Blocking callers in async code go through
//! `tokio::task::spawn_blocking`.
//!
//! Only `Database::create` may create a database file. `Database::open`
//! refuses missing files (no side effects) and verifies the schema.

pub mod app_status;
pub mod doctor;
pub mod market;
pub mod schema;
pub mod types;

use crate::errors::{DipwatchError, DipwatchResult};
use crate::logger::{self, LogTag};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use types::{
    EvaluationRecord, EvaluationStatus, NewSignal, Outcome, Pair, PriceBar, SignalEvent,
    SignalParams, TieBreak, Timeframe, Token, TriggerEvaluation,
};

const BUSY_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Create (or reuse) the database file and install the schema
    pub fn create<P: AsRef<Path>>(path: P) -> DipwatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        crate::paths::ensure_parent_dir(&path)?;

        let conn = Connection::open(&path)?;
        configure_connection(&conn)?;
        schema::create_schema(&conn)?;

        logger::info(
            LogTag::Storage,
            &format!("Database ready at {}", path.display()),
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Open an existing database. Never creates the file.
    pub fn open<P: AsRef<Path>>(path: P) -> DipwatchResult<Self> {
        let db = Self::open_unverified(path)?;
        db.verify_schema()?;
        Ok(db)
    }

    /// Open an existing database without checking its schema (`doctor`)
    pub fn open_unverified<P: AsRef<Path>>(path: P) -> DipwatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(DipwatchError::Config(format!(
                "database '{}' does not exist (run `dipwatch init` first)",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        configure_connection(&conn)?;

        logger::debug(
            LogTag::Storage,
            &format!("Opened database {}", path.display()),
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// In-memory database with schema, for tests and dry experiments
    pub fn open_in_memory() -> DipwatchResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_conn<F, R>(&self, f: F) -> DipwatchResult<R>
    where
        F: FnOnce(&mut Connection) -> DipwatchResult<R>,
    {
        // A panic while holding the lock cannot leave a half-written
        // transaction behind (rusqlite rolls back on drop), so poisoning is
        // not fatal here.
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut conn)
    }

    pub fn verify_schema(&self) -> DipwatchResult<()> {
        self.with_conn(|conn| schema::verify_schema(conn))
    }

    pub fn vacuum(&self) -> DipwatchResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
    }

    /// Row count of one of the known tables
    pub fn count_rows(&self, table: &str) -> DipwatchResult<i64> {
        if !schema::REQUIRED_TABLES.iter().any(|(t, _)| *t == table) {
            return Err(DipwatchError::SchemaIntegrity(format!(
                "unknown table '{}'",
                table
            )));
        }
        self.with_conn(|conn| {
            let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
            Ok(count)
        })
    }
}

fn configure_connection(conn: &Connection) -> DipwatchResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}
