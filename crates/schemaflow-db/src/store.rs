use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use schemaflow_common::{Error, Result};
use schemaflow_config::DatabaseConfig;
use tracing::info;

/// Open the SQLite store at `path` with the configured connection pragmas.
pub fn open_store(path: &Path, config: &DatabaseConfig) -> Result<Connection> {
    info!("opening store at {}", path.display());
    let conn = Connection::open(path)
        .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
    configure(&conn, config)?;
    Ok(conn)
}

/// Open the store for inspection only. Nothing is created and no pragma is
/// changed; a store that does not exist yet reads as an empty one.
pub fn open_store_read_only(path: &Path, config: &DatabaseConfig) -> Result<Connection> {
    if !path.exists() {
        info!("store {} does not exist yet; reading it as empty", path.display());
        return Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")));
    }

    info!("opening store at {} (read-only)", path.display());
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
    Ok(conn)
}

pub fn open_in_memory_store(config: &DatabaseConfig) -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
    configure(&conn, config)?;
    Ok(conn)
}

fn configure(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

    // journal_mode was validated as a bare identifier when the config loaded.
    conn.execute_batch(&format!(
        "PRAGMA journal_mode={}; PRAGMA foreign_keys={};",
        config.journal_mode,
        if config.foreign_keys { "ON" } else { "OFF" }
    ))
    .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
    Ok(())
}
