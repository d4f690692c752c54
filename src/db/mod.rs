pub mod schema;

use rusqlite::Connection;
use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// Open or create the database at `path`, creating parent directories and
/// running migrations.
pub fn open(path: &Path) -> StoreResult<Connection> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| {
      StoreError::Unavailable(format!("failed to create database directory: {}", e))
    })?;
  }

  let conn = Connection::open(path).map_err(|e| {
    StoreError::Unavailable(format!(
      "failed to open database at {}: {}",
      path.display(),
      e
    ))
  })?;

  // journal_mode returns the resulting mode as a row
  conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
  conn.pragma_update(None, "synchronous", "NORMAL")?;

  run_migrations(&conn)?;
  Ok(conn)
}

/// Create an in-memory database (for testing)
pub fn open_in_memory() -> StoreResult<Connection> {
  let conn = Connection::open_in_memory()?;
  run_migrations(&conn)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection) -> StoreResult<()> {
  conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| StoreError::Unavailable(format!("failed to run migrations: {}", e)))
}
