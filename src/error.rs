//! Error types shared across the store, cache and sync layers.

use thiserror::Error;

/// Errors raised by an [`EntryStore`](crate::store::EntryStore) backend.
///
/// Absence is not an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The durable medium could not be reached or written. Transient.
  #[error("storage unavailable: {0}")]
  Unavailable(String),
  /// A stored row could not be decoded.
  #[error("corrupt record '{key}' in {table}: {reason}")]
  Corrupt {
    table: &'static str,
    key: String,
    reason: String,
  },
  /// A query named a column the table does not have.
  #[error("no column '{column}' in {table}")]
  UnknownColumn {
    table: &'static str,
    column: &'static str,
  },
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Unavailable(e.to_string())
  }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by the [`CacheManager`](crate::cache::CacheManager).
#[derive(Error, Debug)]
pub enum CacheError {
  #[error(transparent)]
  Storage(#[from] StoreError),
  #[error("ttl must be greater than zero")]
  InvalidTtl,
  #[error("failed to (de)serialize cached value: {0}")]
  Serde(#[from] serde_json::Error),
}

/// Errors raised by the sync queue and coordinator.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error(transparent)]
  Storage(#[from] StoreError),
  #[error("sync item {0} not found")]
  ItemNotFound(String),
  #[error("sync item {id} is {status}, expected {expected}")]
  InvalidStatus {
    id: String,
    status: &'static str,
    expected: &'static str,
  },
}
