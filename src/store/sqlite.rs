//! SQLite entry store.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{EntryStore, Query, Record, Table};
use crate::db;
use crate::error::{StoreError, StoreResult};

/// SQLite-backed entry store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    Ok(Self {
      conn: Mutex::new(db::open(path)?),
    })
  }

  /// Create an in-memory store (for testing)
  pub fn open_in_memory() -> StoreResult<Self> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory()?),
    })
  }

  fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

fn insert_sql(table: Table) -> String {
  let columns = table.columns();
  let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
  format!(
    "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
    table.name(),
    columns.join(", "),
    placeholders.join(", ")
  )
}

fn select_sql(table: Table, filter: &str) -> String {
  format!(
    "SELECT {} FROM {} {}",
    table.columns().join(", "),
    table.name(),
    filter
  )
}

fn decode<R: Record>(row: &rusqlite::Row<'_>) -> StoreResult<R> {
  R::from_row(row).map_err(|reason| StoreError::Corrupt {
    table: R::TABLE.name(),
    key: row.get::<_, String>(0).unwrap_or_default(),
    reason,
  })
}

fn collect_rows<R: Record>(rows: &mut rusqlite::Rows<'_>) -> StoreResult<Vec<R>> {
  let mut records = Vec::new();
  while let Some(row) = rows.next()? {
    records.push(decode::<R>(row)?);
  }
  Ok(records)
}

impl EntryStore for SqliteStore {
  fn put<R: Record>(&self, record: &R) -> StoreResult<()> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare_cached(&insert_sql(R::TABLE))?;
    stmt.execute(params_from_iter(record.to_row()))?;
    Ok(())
  }

  fn get<R: Record>(&self, key: &str) -> StoreResult<Option<R>> {
    let conn = self.conn()?;
    let table = R::TABLE;
    let sql = select_sql(table, &format!("WHERE {} = ?1", table.key_column()));
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![key])?;

    let record = match rows.next()? {
      Some(row) => Some(decode::<R>(row)?),
      None => None,
    };
    Ok(record)
  }

  fn delete<R: Record>(&self, key: &str) -> StoreResult<()> {
    let conn = self.conn()?;
    let table = R::TABLE;
    conn.execute(
      &format!("DELETE FROM {} WHERE {} = ?1", table.name(), table.key_column()),
      params![key],
    )?;
    Ok(())
  }

  fn batch<R: Record>(&self, puts: &[R], deletes: &[&str]) -> StoreResult<()> {
    let mut conn = self.conn()?;
    let table = R::TABLE;
    let tx = conn.transaction()?;
    {
      let mut delete = tx.prepare_cached(&format!(
        "DELETE FROM {} WHERE {} = ?1",
        table.name(),
        table.key_column()
      ))?;
      for key in deletes {
        delete.execute(params![key])?;
      }

      let mut insert = tx.prepare_cached(&insert_sql(table))?;
      for record in puts {
        insert.execute(params_from_iter(record.to_row()))?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  fn delete_where<R, P>(&self, keys: &[&str], mut predicate: P) -> StoreResult<usize>
  where
    R: Record,
    P: FnMut(&R) -> bool,
  {
    let mut conn = self.conn()?;
    let table = R::TABLE;
    let tx = conn.transaction()?;
    let mut deleted = 0;
    {
      let mut select =
        tx.prepare_cached(&select_sql(table, &format!("WHERE {} = ?1", table.key_column())))?;
      let mut delete = tx.prepare_cached(&format!(
        "DELETE FROM {} WHERE {} = ?1",
        table.name(),
        table.key_column()
      ))?;

      for key in keys {
        let current = {
          let mut rows = select.query(params![key])?;
          match rows.next()? {
            Some(row) => Some(decode::<R>(row)?),
            None => None,
          }
        };
        if current.as_ref().is_some_and(&mut predicate) {
          deleted += delete.execute(params![key])?;
        }
      }
    }
    tx.commit()?;
    Ok(deleted)
  }

  fn select<R: Record>(&self, query: &Query, limit: usize) -> StoreResult<Vec<R>> {
    let table = R::TABLE;
    let columns = table.columns();
    let (filters, order) = query.resolve(table)?;

    let mut clause = String::new();
    let mut values = Vec::with_capacity(filters.len() + 1);
    for (i, (idx, value)) in filters.into_iter().enumerate() {
      clause.push_str(if i == 0 { "WHERE " } else { " AND " });
      clause.push_str(&format!("{} = ?{}", columns[idx], i + 1));
      values.push(value.clone());
    }
    let order: Vec<&str> = order.into_iter().map(|idx| columns[idx]).collect();
    clause.push_str(&format!(
      " ORDER BY {} LIMIT ?{}",
      order.join(", "),
      values.len() + 1
    ));
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let conn = self.conn()?;
    let mut stmt = conn.prepare_cached(&select_sql(table, &clause))?;
    let mut rows = stmt.query(params_from_iter(values))?;
    let records = collect_rows(&mut rows)?;
    Ok(records)
  }

  fn clear<R: Record>(&self) -> StoreResult<()> {
    let conn = self.conn()?;
    conn.execute(&format!("DELETE FROM {}", R::TABLE.name()), [])?;
    Ok(())
  }

  fn last_key<R: Record>(&self) -> StoreResult<Option<String>> {
    let conn = self.conn()?;
    let table = R::TABLE;
    let key: Option<Option<String>> = conn
      .query_row(
        &format!("SELECT MAX({}) FROM {}", table.key_column(), table.name()),
        [],
        |row| row.get(0),
      )
      .optional()?;
    Ok(key.flatten())
  }

  fn page<R: Record>(
    &self,
    after: Option<&str>,
    upto: &str,
    limit: usize,
  ) -> StoreResult<Vec<R>> {
    let conn = self.conn()?;
    let table = R::TABLE;
    let key = table.key_column();
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let records = match after {
      Some(after) => {
        let sql = select_sql(
          table,
          &format!("WHERE {key} > ?1 AND {key} <= ?2 ORDER BY {key} LIMIT ?3"),
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![after, upto, limit])?;
        let records = collect_rows(&mut rows)?;
        records
      }
      None => {
        let sql = select_sql(table, &format!("WHERE {key} <= ?1 ORDER BY {key} LIMIT ?2"));
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![upto, limit])?;
        let records = collect_rows(&mut rows)?;
        records
      }
    };
    Ok(records)
  }
}
