//! Local SQLite database for the offline cache and write queue.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection handle used by the store and the queue.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};

/// Shared database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "offline.db";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize the database at `{data_dir}/offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. The file is never deleted: lock
/// contention and I/O failures are returned as-is. A file SQLite reports as
/// corrupt or not a database is renamed aside (`offline.db.corrupt-<time>`)
/// and a fresh database is created in its place.
pub fn init(data_dir: &Path) -> Result<DbState> {
    init_with_busy_timeout(data_dir, DEFAULT_BUSY_TIMEOUT)
}

pub(crate) fn init_with_busy_timeout(data_dir: &Path, busy_timeout: Duration) -> Result<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening offline database at {}", db_path.display());

    let conn = match open_database(&db_path, busy_timeout) {
        Ok(c) => c,
        Err(e) if is_corruption(&e) => {
            let moved_to = quarantine(&db_path)?;
            error!(
                "Offline database is unreadable ({e}); moved to {} and starting fresh",
                moved_to.display()
            );
            open_database(&db_path, busy_timeout)?
        }
        Err(e) => {
            warn!("Database open failed ({e}); leaving {} untouched", db_path.display());
            return Err(e);
        }
    };

    info!("Offline database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database with the full schema.
pub fn init_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // Before journal_mode, which already needs a lock.
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn is_corruption(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Storage(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the database and its WAL side files out of the way.
fn quarantine(db_path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let moved_to = db_path.with_extension(format!("db.{suffix}"));
    fs::rename(db_path, &moved_to)?;
    for side in ["db-wal", "db-shm"] {
        let side_path = db_path.with_extension(side);
        if side_path.exists() {
            fs::rename(&side_path, db_path.with_extension(format!("{side}.{suffix}")))?;
        }
    }
    Ok(moved_to)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
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
        info!("Offline schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating offline schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, encrypted cache and the write queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- one encrypted blob per entity type
        CREATE TABLE IF NOT EXISTS cache_entries (
            entity_type TEXT PRIMARY KEY,
            blob BLOB NOT NULL,
            record_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        -- FIFO order is the AUTOINCREMENT seq, never created_at
        CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            operation TEXT NOT NULL,
            payload BLOB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: attempt tracking for the dead-letter policy.
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "sync_queue", "attempts")? {
        conn.execute_batch(
            "ALTER TABLE sync_queue ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    if !column_exists(conn, "sync_queue", "last_error")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN last_error TEXT;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_seq ON sync_queue(status, seq);
         INSERT INTO schema_version (version) VALUES (2);",
    )?;
    Ok(())
}

/// Migration v3: entity key so writes to the same row stay ordered around
/// dead letters.
fn migrate_v3(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "sync_queue", "entity_key")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN entity_key TEXT;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_key, status, seq);
         INSERT INTO schema_version (version) VALUES (3);",
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(names.iter().any(|n| n == column))
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
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

impl DbState {
    /// Run `f` with the locked connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| SyncError::LockPoisoned)?;
        f(&conn)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
