//! Database connection and schema management

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::storage::error::{StorageError, StorageResult};

/// Shared handle to the session database.
///
/// Every component that touches the store serializes through this mutex.
/// Guards are scoped so they are never held across an await point.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database connection wrapper.
///
/// Owns the SQLite connection and manages schema initialization.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database at the given path, creating it and its schema if
    /// needed.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database. Used primarily for testing.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Wraps the database in the shared handle used by the runtime.
    #[must_use]
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Locks a shared handle, mapping a poisoned mutex to a storage error.
    pub fn lock(db: &SharedDatabase) -> StorageResult<MutexGuard<'_, Database>> {
        db.lock()
            .map_err(|e| StorageError::InvalidData(format!("Database lock poisoned: {e}")))
    }

    /// Returns a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> StorageResult<()> {
        // Foreign key enforcement is off by default and per-connection
        self.conn.execute("PRAGMA foreign_keys = ON", [])?;
        self.init_schema()
    }

    /// Initializes the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        info!("Initializing session store schema");

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                display_id TEXT NOT NULL UNIQUE,
                project_id TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                last_activity_at TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                end_reason TEXT,
                hours_inactive REAL,
                title TEXT,
                description TEXT,
                agent_type TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            [],
        )?;

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS session_bindings (
                binding_key TEXT PRIMARY KEY,
                session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
                bound_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS display_id_counters (
                year INTEGER PRIMARY KEY,
                counter INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_status_activity
             ON sessions(status, last_activity_at)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_project_id
             ON sessions(project_id)",
            [],
        )?;

        info!("Session store schema initialized");
        Ok(())
    }

    /// Executes a function within a database transaction.
    ///
    /// The transaction commits when the closure returns `Ok` and rolls back
    /// when it returns `Err`.
    pub fn transaction<T, F>(&mut self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> StorageResult<T>,
    {
        let tx = self.conn.transaction()?;
        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                // Rollback happens automatically when tx is dropped
                Err(e)
            }
        }
    }
}
