//! Entry store trait, record mapping and the paging scan iterator.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, Value};
use rusqlite::Row;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::error::{StoreError, StoreResult};

/// Rows fetched per round trip while scanning.
pub const SCAN_PAGE_SIZE: usize = 128;

/// The logical tables held by an entry store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
  CacheEntries,
  SyncItems,
}

impl Table {
  pub fn name(&self) -> &'static str {
    match self {
      Table::CacheEntries => "cache_entries",
      Table::SyncItems => "sync_items",
    }
  }

  /// Column order used by [`Record::to_row`] and [`Record::from_row`].
  /// The first column is always the primary key.
  pub fn columns(&self) -> &'static [&'static str] {
    match self {
      Table::CacheEntries => &["key", "value", "checksum", "created_at", "expires_at"],
      Table::SyncItems => &[
        "id",
        "entity_type",
        "entity_id",
        "operation",
        "payload",
        "local_modified_at",
        "status",
        "conflict_payload",
        "retry_count",
        "last_error",
        "next_attempt_at",
        "status_changed_at",
      ],
    }
  }

  pub fn key_column(&self) -> &'static str {
    self.columns()[0]
  }

  pub fn column_index(&self, name: &str) -> Option<usize> {
    self.columns().iter().position(|c| *c == name)
  }
}

/// Equality filters and an ordering for [`EntryStore::select`].
///
/// Results are always ordered by the primary key last, so equal sort
/// columns come back in key order.
#[derive(Debug, Clone, Default)]
pub struct Query {
  filters: Vec<(&'static str, Value)>,
  order_by: Vec<&'static str>,
}

impl Query {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn eq(mut self, column: &'static str, value: Value) -> Self {
    self.filters.push((column, value));
    self
  }

  pub fn order_by(mut self, column: &'static str) -> Self {
    self.order_by.push(column);
    self
  }

  /// Column positions of the filters and of the ordering (key appended).
  pub fn resolve(&self, table: Table) -> StoreResult<(Vec<(usize, &Value)>, Vec<usize>)> {
    let index = |column: &'static str| {
      table.column_index(column).ok_or(StoreError::UnknownColumn {
        table: table.name(),
        column,
      })
    };

    let filters = self
      .filters
      .iter()
      .map(|(column, value)| Ok((index(column)?, value)))
      .collect::<StoreResult<Vec<_>>>()?;
    let mut order = self
      .order_by
      .iter()
      .map(|column| index(column))
      .collect::<StoreResult<Vec<_>>>()?;
    if !order.contains(&0) {
      order.push(0);
    }
    Ok((filters, order))
  }
}

/// A record persisted in one of the store's tables.
///
/// Records carry an explicit column mapping for SQL backends and are
/// serde-serializable for backends that keep opaque blobs.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  const TABLE: Table;

  /// Primary key of this record.
  fn key(&self) -> &str;

  /// Column values, in [`Table::columns`] order.
  fn to_row(&self) -> Vec<Value>;

  /// Decode a row selected with [`Table::columns`].
  fn from_row(row: &Row<'_>) -> Result<Self, String>;
}

/// Durable key-value persistence addressed by table and key.
///
/// The table is selected by the record type, e.g. `store.get::<CacheEntry>(key)`.
pub trait EntryStore: Send + Sync {
  /// Insert or overwrite a record atomically.
  fn put<R: Record>(&self, record: &R) -> StoreResult<()>;

  /// Returns `Ok(None)` when absent.
  fn get<R: Record>(&self, key: &str) -> StoreResult<Option<R>>;

  /// Idempotent: deleting a missing key succeeds.
  fn delete<R: Record>(&self, key: &str) -> StoreResult<()>;

  /// Apply several puts and deletes to one table as a single atomic write.
  fn batch<R: Record>(&self, puts: &[R], deletes: &[&str]) -> StoreResult<()>;

  /// Delete each of `keys` whose current record still satisfies
  /// `predicate`, as one atomic write. Returns how many were deleted.
  fn delete_where<R, P>(&self, keys: &[&str], predicate: P) -> StoreResult<usize>
  where
    R: Record,
    P: FnMut(&R) -> bool;

  /// Records matching `query` in its order, at most `limit`. SQL backends
  /// serve this from an index where one covers the columns.
  fn select<R: Record>(&self, query: &Query, limit: usize) -> StoreResult<Vec<R>>;

  /// Remove every record of the table.
  fn clear<R: Record>(&self) -> StoreResult<()>;

  /// Largest key currently present in the table.
  fn last_key<R: Record>(&self) -> StoreResult<Option<String>>;

  /// Records with `after < key <= upto` in key order, at most `limit`.
  fn page<R: Record>(&self, after: Option<&str>, upto: &str, limit: usize)
    -> StoreResult<Vec<R>>;

  /// Lazily iterate records matching `predicate`.
  ///
  /// The scan is bounded by the largest key present when it first advances,
  /// so it always terminates. Calling `scan` again starts a fresh pass.
  fn scan<R, P>(&self, predicate: P) -> Scan<'_, Self, R, P>
  where
    Self: Sized,
    R: Record,
    P: FnMut(&R) -> bool,
  {
    Scan::new(self, predicate)
  }
}

/// Paging iterator returned by [`EntryStore::scan`].
pub struct Scan<'a, S: ?Sized, R, P> {
  store: &'a S,
  predicate: P,
  upto: Option<String>,
  cursor: Option<String>,
  buffer: VecDeque<R>,
  started: bool,
  done: bool,
  _record: PhantomData<R>,
}

impl<'a, S, R, P> Scan<'a, S, R, P>
where
  S: EntryStore,
  R: Record,
  P: FnMut(&R) -> bool,
{
  fn new(store: &'a S, predicate: P) -> Self {
    Self {
      store,
      predicate,
      upto: None,
      cursor: None,
      buffer: VecDeque::new(),
      started: false,
      done: false,
      _record: PhantomData,
    }
  }

  fn fill(&mut self) -> StoreResult<()> {
    if !self.started {
      self.started = true;
      self.upto = self.store.last_key::<R>()?;
    }

    let Some(upto) = self.upto.as_deref() else {
      self.done = true;
      return Ok(());
    };

    while self.buffer.is_empty() && !self.done {
      let page = self
        .store
        .page::<R>(self.cursor.as_deref(), upto, SCAN_PAGE_SIZE)?;

      if page.len() < SCAN_PAGE_SIZE {
        self.done = true;
      }
      match page.last() {
        Some(last) => self.cursor = Some(last.key().to_string()),
        None => self.done = true,
      }

      for record in page {
        if (self.predicate)(&record) {
          self.buffer.push_back(record);
        }
      }
    }

    Ok(())
  }
}

impl<'a, S, R, P> Iterator for Scan<'a, S, R, P>
where
  S: EntryStore,
  R: Record,
  P: FnMut(&R) -> bool,
{
  type Item = StoreResult<R>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.buffer.is_empty() && !self.done {
      if let Err(e) = self.fill() {
        self.done = true;
        return Some(Err(e));
      }
    }
    self.buffer.pop_front().map(Ok)
  }
}

// ============================================================================
// Row helpers
// ============================================================================

/// Format a timestamp for storage.
pub fn format_time(t: &DateTime<Utc>) -> String {
  t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| format!("bad timestamp '{}': {}", s, e))
}

/// Read column `idx`, turning conversion errors into decode messages.
pub fn column<T: FromSql>(row: &Row<'_>, idx: usize) -> Result<T, String> {
  row
    .get(idx)
    .map_err(|e| format!("column {}: {}", idx, e))
}

pub fn text(s: &str) -> Value {
  Value::Text(s.to_string())
}

pub fn opt_text(s: Option<String>) -> Value {
  s.map(Value::Text).unwrap_or(Value::Null)
}
