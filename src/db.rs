//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Two independent stores exist per terminal:
//! the terminal database (product cache, cart, orders, outbox, print queue,
//! sync watermark) and the background bridge's own queue database. Each is
//! opened through [`init`] with the matching [`Schema`] and migrated to its
//! current version.

use chrono::Utc;
use rusqlite::{Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::PosError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A store holding one connection. All writers go through the mutex, which
/// makes the store the single writer at any instant.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, PosError> {
        Ok(self.conn.lock()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Terminal,
    Bridge,
}

impl Schema {
    fn current_version(&self) -> i32 {
        match self {
            Schema::Terminal => 2,
            Schema::Bridge => 1,
        }
    }
}

/// Initialize the database at `path`.
///
/// Creates the parent directory if needed, opens the connection, sets
/// pragmas, and runs any pending migrations. A busy or locked file is an
/// error for the caller; only a file SQLite reports as corrupt or not a
/// database is moved aside (never deleted) and replaced by a fresh store.
pub fn init(path: &Path, schema: Schema) -> Result<DbState, PosError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    info!("Opening database at {}", path.display());

    let conn = match open_and_configure(path) {
        Ok(c) => c,
        Err(e) if is_corruption(&e) => {
            let aside = quarantine(path)?;
            warn!(
                "Database at {} is unreadable ({e}); moved to {} and starting fresh",
                path.display(),
                aside.display()
            );
            open_and_configure(path)?
        }
        Err(e) => {
            error!("Database open failed ({e}); leaving {} untouched", path.display());
            return Err(e);
        }
    };

    run_migrations(&conn, schema)?;

    info!(
        "Database initialized ({schema:?} schema v{})",
        schema.current_version()
    );

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: path.to_path_buf(),
    })
}

fn is_corruption(err: &PosError) -> bool {
    matches!(
        err,
        PosError::Database(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the store and its WAL/SHM companions to `*.corrupt-<ms>`.
fn quarantine(path: &Path) -> Result<PathBuf, PosError> {
    let suffix = format!("corrupt-{}", Utc::now().timestamp_millis());
    let aside = PathBuf::from(format!("{}.{suffix}", path.display()));
    fs::rename(path, &aside)?;
    for companion in ["-wal", "-shm"] {
        let side = PathBuf::from(format!("{}{companion}", path.display()));
        if side.exists() {
            let target = PathBuf::from(format!("{}{companion}.{suffix}", path.display()));
            if let Err(e) = fs::rename(&side, &target) {
                warn!("Failed to move {} aside: {e}", side.display());
            }
        }
    }
    Ok(aside)
}

/// Open a fully migrated in-memory store.
pub fn open_in_memory(schema: Schema) -> Result<DbState, PosError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn, schema)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, PosError> {
    let conn = Connection::open(path)?;

    // Must precede the journal_mode switch, which needs a lock.
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations for `schema`.
fn run_migrations(conn: &Connection, schema: Schema) -> Result<(), PosError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let target = schema.current_version();
    if current >= target {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating {schema:?} database from v{current} to v{target}");

    match schema {
        Schema::Terminal => {
            if current < 1 {
                migrate_terminal_v1(conn)?;
            }
            if current < 2 {
                migrate_terminal_v2(conn)?;
            }
        }
        Schema::Bridge => {
            if current < 1 {
                migrate_bridge_v1(conn)?;
            }
        }
    }

    Ok(())
}

/// Terminal v1: entity caches, outbox and watermark.
fn migrate_terminal_v1(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            position INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS cart (
            product_id TEXT PRIMARY KEY,
            qty INTEGER NOT NULL CHECK (qty > 0)
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            items TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'preparing', 'ready', 'completed')),
            comments TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER
        );

        -- change_queue (append-only outbox)
        CREATE TABLE IF NOT EXISTS change_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            authored_at INTEGER NOT NULL,
            server_assigned_at INTEGER,
            queued_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sync_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_sync_at INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        INSERT OR IGNORE INTO sync_meta (id, last_sync_at) VALUES (1, 0);

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Terminal v2: print queue.
fn migrate_terminal_v2(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS print_jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            order_id TEXT NOT NULL,
            destination TEXT NOT NULL CHECK (destination IN ('receipt', 'kitchen')),
            priority INTEGER NOT NULL DEFAULT 1,
            content TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'queued'
                CHECK (status IN ('queued', 'printing', 'done', 'error')),
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_print_jobs_status ON print_jobs(status);
        CREATE INDEX IF NOT EXISTS idx_print_jobs_pick ON print_jobs(status, destination, priority, seq);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Bridge v1: the bridge's own durable queue.
fn migrate_bridge_v1(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS bridge_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            authored_at INTEGER NOT NULL,
            server_assigned_at INTEGER,
            queued_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Bridge migration v1 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied bridge migration v1");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_terminal_migrations_create_all_stores() {
        let db = open_in_memory(Schema::Terminal).expect("open");
        let conn = db.lock().unwrap();
        let tables = table_names(&conn);
        for t in [
            "products",
            "cart",
            "orders",
            "change_queue",
            "print_jobs",
            "sync_meta",
        ] {
            assert!(tables.contains(&t.to_string()), "missing {t}");
        }
        assert!(!tables.contains(&"bridge_queue".to_string()));

        let watermark: i64 = conn
            .query_row("SELECT last_sync_at FROM sync_meta WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(watermark, 0);
    }

    #[test]
    fn test_bridge_schema_is_separate() {
        let db = open_in_memory(Schema::Bridge).expect("open");
        let conn = db.lock().unwrap();
        let tables = table_names(&conn);
        assert!(tables.contains(&"bridge_queue".to_string()));
        assert!(!tables.contains(&"orders".to_string()));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory(Schema::Terminal).expect("open");
        let conn = db.lock().unwrap();
        run_migrations(&conn, Schema::Terminal).expect("second run");
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(versions, 2);
    }

    #[test]
    fn test_init_on_disk_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("pos-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("terminal_pos.db");
        {
            let db = init(&path, Schema::Terminal).expect("init");
            db.lock()
                .unwrap()
                .execute(
                    "INSERT INTO cart (product_id, qty) VALUES ('p1', 2)",
                    [],
                )
                .unwrap();
        }
        let db = init(&path, Schema::Terminal).expect("reopen");
        let qty: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT qty FROM cart WHERE product_id = 'p1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(qty, 2);
        let _ = fs::remove_dir_all(dir);
    }

    fn temp_db(name: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("pos-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join(name);
        (dir, path)
    }

    fn quarantined_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".corrupt-"))
            .collect()
    }

    #[test]
    fn test_locked_store_keeps_pending_changes() {
        use crate::models::{Mutation, MutationKind};
        use crate::outbox::ChangeLog;
        use std::sync::Arc;

        let (dir, path) = temp_db("cashier_pos.db");
        {
            let db = Arc::new(init(&path, Schema::Terminal).expect("init"));
            let m = Mutation::authored(
                MutationKind::CartAdd,
                serde_json::json!({ "productId": "p1" }),
                1,
            );
            assert!(ChangeLog::outbox(db).append(&m).unwrap());
        }

        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        match init(&path, Schema::Terminal) {
            Ok(db) => assert_eq!(ChangeLog::outbox(Arc::new(db)).len().unwrap(), 1),
            Err(e) => assert!(!is_corruption(&e), "lock misread as corruption: {e}"),
        }
        holder.execute_batch("COMMIT;").unwrap();
        drop(holder);

        let db = Arc::new(init(&path, Schema::Terminal).expect("reopen"));
        assert_eq!(ChangeLog::outbox(db).len().unwrap(), 1);
        assert!(quarantined_files(&dir).is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_store_is_moved_aside_not_deleted() {
        let (dir, path) = temp_db("kitchen_bridge.db");
        fs::create_dir_all(&dir).unwrap();
        let garbage = vec![b'x'; 4096];
        fs::write(&path, &garbage).unwrap();

        let db = init(&path, Schema::Bridge).expect("fresh store after corruption");
        let queued: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM bridge_queue", [], |r| r.get(0))
            .unwrap();
        assert_eq!(queued, 0);

        let aside = quarantined_files(&dir);
        assert_eq!(aside.len(), 1, "{aside:?}");
        assert!(aside[0].starts_with("kitchen_bridge.db.corrupt-"));
        assert_eq!(fs::read(dir.join(&aside[0])).unwrap(), garbage);
        let _ = fs::remove_dir_all(dir);
    }
}
