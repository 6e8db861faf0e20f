//! Database module for mesh observer persistence
//!
//! Provides SQLite database initialization and connection management for
//! node, packet-history, topology, traceroute, and probe-attempt state.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Shared handle to the single writer connection. Store services borrow it
/// per operation, which serializes all writes.
pub type DbConnection = Arc<Mutex<Connection>>;

/// Errors surfaced by the store services
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization error for route/raw-packet columns
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Current UTC time as epoch milliseconds, the representation used by every
/// `*_utc` column.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Open (or create) the observer database at `db_path`.
///
/// Applies the pragmas the store relies on, runs the schema, and adds any
/// columns a database created by an older version is missing.
pub fn init_database(db_path: &Path) -> StoreResult<DbConnection> {
    let conn = Connection::open(db_path)?;

    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // journal_mode replies with a row, which execute() rejects.
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let schema_sql = include_str!("../migrations/001_initial_schema.sql");
    conn.execute_batch(schema_sql)?;

    migrate_columns(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// Add columns that predate the consolidated schema. CREATE TABLE IF NOT
/// EXISTS leaves an existing older table untouched, so column presence is
/// probed explicitly.
fn migrate_columns(conn: &Connection) -> StoreResult<()> {
    add_column_if_missing(conn, "nodes", "is_ignored", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "nodes", "is_airplane", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "nodes", "last_name_update_utc", "INTEGER")?;
    add_column_if_missing(conn, "packet_history", "message_text", "TEXT")?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get(1))?
        .collect::<Result<Vec<_>, _>>()?;

    if columns.iter().any(|c| c == column) {
        return Ok(false);
    }

    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )?;
    tracing::info!("Added {} column to {} table", column, table);
    Ok(true)
}
