//! In-process entry store.

use rusqlite::types::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::traits::{EntryStore, Query, Record, Table};
use crate::error::{StoreError, StoreResult};

type Tables = HashMap<Table, BTreeMap<String, Vec<u8>>>;

/// Entry store backed by ordered in-memory maps of serialized records.
///
/// Nothing survives the process. Useful for tests and for applications that
/// want the queue semantics without a database file. `set_unavailable`
/// makes every call fail with [`StoreError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
  tables: Mutex<Tables>,
  unavailable: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate an outage of the backing medium.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("memory store offline".into()));
    }
    self
      .tables
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

fn encode<R: Record>(record: &R) -> StoreResult<Vec<u8>> {
  serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
    table: R::TABLE.name(),
    key: record.key().to_string(),
    reason: e.to_string(),
  })
}

fn decode<R: Record>(key: &str, data: &[u8]) -> StoreResult<R> {
  serde_json::from_slice(data).map_err(|e| StoreError::Corrupt {
    table: R::TABLE.name(),
    key: key.to_string(),
    reason: e.to_string(),
  })
}

/// SQLite's cross-type ordering: NULL, numbers, text, blobs.
fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
  fn rank(v: &Value) -> u8 {
    match v {
      Value::Null => 0,
      Value::Integer(_) | Value::Real(_) => 1,
      Value::Text(_) => 2,
      Value::Blob(_) => 3,
    }
  }

  match (a, b) {
    (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
    (Value::Integer(x), Value::Real(y)) => (*x as f64).total_cmp(y),
    (Value::Real(x), Value::Integer(y)) => x.total_cmp(&(*y as f64)),
    (Value::Real(x), Value::Real(y)) => x.total_cmp(y),
    (Value::Text(x), Value::Text(y)) => x.cmp(y),
    (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
    _ => rank(a).cmp(&rank(b)),
  }
}

impl EntryStore for MemoryStore {
  fn put<R: Record>(&self, record: &R) -> StoreResult<()> {
    let data = encode(record)?;
    let mut tables = self.tables()?;
    tables
      .entry(R::TABLE)
      .or_default()
      .insert(record.key().to_string(), data);
    Ok(())
  }

  fn get<R: Record>(&self, key: &str) -> StoreResult<Option<R>> {
    let tables = self.tables()?;
    let record = match tables.get(&R::TABLE).and_then(|t| t.get(key)) {
      Some(data) => Some(decode(key, data)?),
      None => None,
    };
    Ok(record)
  }

  fn delete<R: Record>(&self, key: &str) -> StoreResult<()> {
    let mut tables = self.tables()?;
    if let Some(table) = tables.get_mut(&R::TABLE) {
      table.remove(key);
    }
    Ok(())
  }

  fn batch<R: Record>(&self, puts: &[R], deletes: &[&str]) -> StoreResult<()> {
    // Encode everything up front so a bad record leaves the table untouched
    let encoded = puts
      .iter()
      .map(|r| Ok((r.key().to_string(), encode(r)?)))
      .collect::<StoreResult<Vec<_>>>()?;

    let mut tables = self.tables()?;
    let table = tables.entry(R::TABLE).or_default();
    for key in deletes {
      table.remove(*key);
    }
    table.extend(encoded);
    Ok(())
  }

  fn delete_where<R, P>(&self, keys: &[&str], mut predicate: P) -> StoreResult<usize>
  where
    R: Record,
    P: FnMut(&R) -> bool,
  {
    let mut tables = self.tables()?;
    let Some(table) = tables.get_mut(&R::TABLE) else {
      return Ok(0);
    };

    let mut matched = Vec::new();
    for key in keys {
      if let Some(data) = table.get(*key) {
        if predicate(&decode::<R>(key, data)?) {
          matched.push(*key);
        }
      }
    }
    for key in &matched {
      table.remove(*key);
    }
    Ok(matched.len())
  }

  fn select<R: Record>(&self, query: &Query, limit: usize) -> StoreResult<Vec<R>> {
    let (filters, order) = query.resolve(R::TABLE)?;
    let tables = self.tables()?;
    let Some(table) = tables.get(&R::TABLE) else {
      return Ok(Vec::new());
    };

    let mut matched = Vec::new();
    for (key, data) in table {
      let record = decode::<R>(key, data)?;
      let row = record.to_row();
      if filters.iter().all(|(idx, value)| row[*idx] == **value) {
        matched.push((row, record));
      }
    }

    matched.sort_by(|(a, _), (b, _)| {
      order
        .iter()
        .map(|idx| compare_values(&a[*idx], &b[*idx]))
        .find(|o| o.is_ne())
        .unwrap_or(CmpOrdering::Equal)
    });
    Ok(
      matched
        .into_iter()
        .take(limit)
        .map(|(_, record)| record)
        .collect(),
    )
  }

  fn clear<R: Record>(&self) -> StoreResult<()> {
    let mut tables = self.tables()?;
    tables.remove(&R::TABLE);
    Ok(())
  }

  fn last_key<R: Record>(&self) -> StoreResult<Option<String>> {
    let tables = self.tables()?;
    Ok(
      tables
        .get(&R::TABLE)
        .and_then(|t| t.keys().next_back().cloned()),
    )
  }

  fn page<R: Record>(
    &self,
    after: Option<&str>,
    upto: &str,
    limit: usize,
  ) -> StoreResult<Vec<R>> {
    let tables = self.tables()?;
    let Some(table) = tables.get(&R::TABLE) else {
      return Ok(Vec::new());
    };

    let lower = match after {
      Some(after) => Bound::Excluded(after),
      None => Bound::Unbounded,
    };

    let records = table
      .range::<str, _>((lower, Bound::Included(upto)))
      .take(limit)
      .map(|(key, data)| decode(key, data))
      .collect::<StoreResult<Vec<R>>>()?;
    Ok(records)
  }
}
