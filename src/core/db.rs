use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::CustodesError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::CustodesError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::CustodesError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::CustodesError::RusqliteError)?;
    Ok(conn)
}

pub fn custodes_db_path(root: &Path) -> PathBuf {
    root.join(schemas::CUSTODES_DB_NAME)
}

// Subsystems own their schemas and initialization; see `subsystems.rs`.
