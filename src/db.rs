//! Local SQLite database layer for Preventa.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection state used by the store, the order state machine
//! and the cache agent.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info};

/// Storage faults. Always surfaced to the caller, never swallowed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error in {table}/{key}: {source}")]
    Serialization {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("migration v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl std::fmt::Debug for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbState")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl DbState {
    /// Lock the connection. A poisoned lock is reported as a storage fault.
    pub fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Open a fully migrated in-memory database. Used by tests and by
    /// ephemeral tooling that must not touch the data directory.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/preventa.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, and
/// runs any pending migrations. An open failure is returned as-is: the file
/// may hold committed orders that have not reached the server yet.
pub fn init(data_dir: &Path) -> StoreResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join("preventa.db");
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "Database open failed");
        e
    })?;

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the named-table record store.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY(setting_category, setting_key)
        );

        -- records: every named table (orders, sync_queue, read-model caches)
        CREATE TABLE IF NOT EXISTS records (
            table_name TEXT NOT NULL,
            record_key TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY(table_name, record_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|source| {
        error!("Migration v1 failed: {source}");
        StoreError::Migration { version: 1, source }
    })?;

    info!("Applied migration v1 (local_settings + records)");
    Ok(())
}

/// Migration v2: versioned response cache tiers for the dispatch agent.
fn migrate_v2(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_name TEXT NOT NULL,
            request_key TEXT NOT NULL,
            status INTEGER NOT NULL,
            content_type TEXT,
            body BLOB NOT NULL,
            stored_at TEXT NOT NULL,
            PRIMARY KEY(cache_name, request_key)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_cache_name
            ON cache_entries(cache_name);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|source| {
        error!("Migration v2 failed: {source}");
        StoreError::Migration { version: 2, source }
    })?;

    info!("Applied migration v2 (cache_entries)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// All settings of one category as `(key, value)` pairs, ordered by key.
pub fn get_category_settings(conn: &Connection, category: &str) -> StoreResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT setting_key, setting_value FROM local_settings
         WHERE setting_category = ?1 ORDER BY setting_key",
    )?;
    let rows = stmt
        .query_map(params![category], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, String)>, _>>()?;
    Ok(rows)
}

/// Read the schema version currently applied.
pub fn schema_version(conn: &Connection) -> StoreResult<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        assert!(tables.contains(&"local_settings".to_string()));
        assert!(tables.contains(&"records".to_string()));
        assert!(tables.contains(&"cache_entries".to_string()));

        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_and_configure(&dir.path().join("wal.db")).expect("open temp db");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
    }

    #[test]
    fn test_settings_round_trip_and_overwrite() {
        let conn = test_db();
        run_migrations(&conn).unwrap();

        assert_eq!(get_setting(&conn, "sync", "max_retries").unwrap(), None);
        set_setting(&conn, "sync", "max_retries", "4").unwrap();
        set_setting(&conn, "sync", "max_retries", "5").unwrap();
        set_setting(&conn, "sync", "api_url", "https://api.example.test").unwrap();

        assert_eq!(
            get_setting(&conn, "sync", "max_retries").unwrap().as_deref(),
            Some("5")
        );
        let all = get_category_settings(&conn, "sync").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "api_url");
    }

    #[test]
    fn test_init_creates_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("nested").join("data");
        let state = init(&nested).expect("init");
        assert!(state.db_path.exists());
        let conn = state.lock().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }
}
