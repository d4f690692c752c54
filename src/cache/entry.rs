//! Cache entry record and its durable row mapping.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{column, format_time, parse_time, text, Record, Table};

/// A cached value with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  /// Opaque serialized payload
  pub value: Vec<u8>,
  pub created_at: DateTime<Utc>,
  /// Always later than `created_at`
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(
    key: impl Into<String>,
    value: Vec<u8>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
  ) -> Self {
    debug_assert!(expires_at > created_at);
    Self {
      key: key.into(),
      value,
      created_at,
      expires_at,
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }

  /// SHA-256 of the value, hex encoded.
  pub fn checksum(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&self.value);
    hex::encode(hasher.finalize())
  }
}

impl Record for CacheEntry {
  const TABLE: Table = Table::CacheEntries;

  fn key(&self) -> &str {
    &self.key
  }

  fn to_row(&self) -> Vec<Value> {
    vec![
      text(&self.key),
      Value::Blob(self.value.clone()),
      Value::Text(self.checksum()),
      Value::Text(format_time(&self.created_at)),
      Value::Text(format_time(&self.expires_at)),
    ]
  }

  fn from_row(row: &Row<'_>) -> Result<Self, String> {
    let entry = Self {
      key: column(row, 0)?,
      value: column(row, 1)?,
      created_at: parse_time(&column::<String>(row, 3)?)?,
      expires_at: parse_time(&column::<String>(row, 4)?)?,
    };

    let stored: String = column(row, 2)?;
    if stored != entry.checksum() {
      return Err("checksum mismatch".to_string());
    }
    if entry.expires_at <= entry.created_at {
      return Err("expires_at is not after created_at".to_string());
    }
    Ok(entry)
  }
}
