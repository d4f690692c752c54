//! Durable, coalescing queue of local mutations.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::item::{Operation, SyncItem, SyncStatus};
use super::retry::RetryPolicy;
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::{StoreError, SyncError};
use crate::store::{text, EntryStore, Query};

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// The local payload is pending again
  Requeued { id: String },
  /// The remote snapshot is now the local state; apply it to local data
  AdoptedRemote { snapshot: Option<serde_json::Value> },
  /// A newer local mutation for the same entity is already queued
  Superseded { by: String },
}

/// Number of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: usize,
  pub syncing: usize,
  pub synced: usize,
  pub conflict: usize,
  pub failed: usize,
}

impl QueueCounts {
  pub fn get(&self, status: SyncStatus) -> usize {
    match status {
      SyncStatus::Pending => self.pending,
      SyncStatus::Syncing => self.syncing,
      SyncStatus::Synced => self.synced,
      SyncStatus::Conflict => self.conflict,
      SyncStatus::Failed => self.failed,
    }
  }

  fn bump(&mut self, status: SyncStatus) {
    match status {
      SyncStatus::Pending => self.pending += 1,
      SyncStatus::Syncing => self.syncing += 1,
      SyncStatus::Synced => self.synced += 1,
      SyncStatus::Conflict => self.conflict += 1,
      SyncStatus::Failed => self.failed += 1,
    }
  }
}

/// Items with `status`, oldest local change first.
fn by_status(status: SyncStatus) -> Query {
  Query::new()
    .eq("status", text(status.as_str()))
    .order_by("local_modified_at")
}

/// Strictly increasing, zero-padded microsecond ids.
#[derive(Debug, Default)]
struct IdGenerator {
  last: AtomicU64,
}

impl IdGenerator {
  fn seeded(last: Option<&str>) -> Self {
    let last = last.and_then(|id| id.parse::<u64>().ok()).unwrap_or(0);
    Self {
      last: AtomicU64::new(last),
    }
  }

  fn next(&self, now: DateTime<Utc>) -> String {
    let stamp = u64::try_from(now.timestamp_micros()).unwrap_or(0);
    let mut last = self.last.load(Ordering::SeqCst);
    loop {
      let candidate = stamp.max(last + 1);
      match self
        .last
        .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
      {
        Ok(_) => return format!("{:020}", candidate),
        Err(actual) => last = actual,
      }
    }
  }
}

/// Ordered record of pending local mutations.
///
/// Every read-modify-write runs under one lock, so claims made by
/// `dequeue_pending` never overlap.
pub struct SyncQueue<S: EntryStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
  retry: RetryPolicy,
  ids: IdGenerator,
  lock: Mutex<()>,
}

impl<S: EntryStore> SyncQueue<S> {
  pub fn new(store: Arc<S>) -> Result<Self, SyncError> {
    let last = store.last_key::<SyncItem>()?;
    Ok(Self {
      store,
      clock: Arc::new(SystemClock),
      retry: RetryPolicy::default(),
      ids: IdGenerator::seeded(last.as_deref()),
      lock: Mutex::new(()),
    })
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  fn guard(&self) -> MutexGuard<'_, ()> {
    self.lock.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record a local mutation, coalescing with the entity's outstanding item.
  pub fn enqueue(
    &self,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: Option<serde_json::Value>,
  ) -> Result<SyncItem, SyncError> {
    let _guard = self.guard();
    let now = self.clock.now();

    let item = match self.find_outstanding(entity_type, entity_id)? {
      Some(mut item) if item.status == SyncStatus::Pending => {
        // The remote has not seen a pending create yet
        if !(item.operation == Operation::Create && operation == Operation::Update) {
          item.operation = operation;
        }
        item.payload = if operation == Operation::Delete {
          None
        } else {
          payload
        };
        item.local_modified_at = now;
        self.store.put(&item)?;
        debug!(id = %item.id, entity_type, entity_id, "coalesced into pending item");
        item
      }
      Some(in_flight) => {
        // Replace under a new id so the in-flight result cannot mark this
        // payload as synced
        let item = SyncItem::new(
          self.ids.next(now),
          entity_type,
          entity_id,
          operation,
          payload,
          now,
        );
        self
          .store
          .batch(std::slice::from_ref(&item), &[in_flight.id.as_str()])?;
        debug!(
          id = %item.id,
          replaced = %in_flight.id,
          entity_type,
          entity_id,
          "replaced in-flight item"
        );
        item
      }
      None => {
        let item = SyncItem::new(
          self.ids.next(now),
          entity_type,
          entity_id,
          operation,
          payload,
          now,
        );
        self.store.put(&item)?;
        debug!(id = %item.id, entity_type, entity_id, %operation, "enqueued");
        item
      }
    };

    Ok(item)
  }

  fn find_outstanding(
    &self,
    entity_type: &str,
    entity_id: &str,
  ) -> Result<Option<SyncItem>, StoreError> {
    let query = Query::new()
      .eq("entity_type", text(entity_type))
      .eq("entity_id", text(entity_id));
    let history = self.store.select::<SyncItem>(&query, usize::MAX)?;
    Ok(history.into_iter().find(|item| item.status.is_outstanding()))
  }

  /// The pending or syncing item for an entity, if any.
  pub fn outstanding_for(
    &self,
    entity_type: &str,
    entity_id: &str,
  ) -> Result<Option<SyncItem>, SyncError> {
    Ok(self.find_outstanding(entity_type, entity_id)?)
  }

  pub fn get(&self, id: &str) -> Result<Option<SyncItem>, SyncError> {
    Ok(self.store.get::<SyncItem>(id)?)
  }

  /// Claim up to `limit` ready items, oldest local change first, marking
  /// them `Syncing`.
  pub fn dequeue_pending(&self, limit: usize) -> Result<Vec<SyncItem>, SyncError> {
    let _guard = self.guard();
    let now = self.clock.now();

    let mut ready: Vec<SyncItem> = self
      .store
      .select::<SyncItem>(&by_status(SyncStatus::Pending), usize::MAX)?
      .into_iter()
      .filter(|item| item.is_ready(now))
      .take(limit)
      .collect();

    for item in &mut ready {
      item.set_status(SyncStatus::Syncing, now);
    }
    if !ready.is_empty() {
      self.store.batch(&ready, &[])?;
    }

    Ok(ready)
  }

  /// Apply `change` to item `id` if it is currently `expected`.
  ///
  /// Returns `Ok(None)` when the item no longer exists (superseded).
  fn transition<F>(
    &self,
    id: &str,
    expected: SyncStatus,
    change: F,
  ) -> Result<Option<SyncItem>, SyncError>
  where
    F: FnOnce(&mut SyncItem, DateTime<Utc>),
  {
    let _guard = self.guard();
    let Some(mut item) = self.store.get::<SyncItem>(id)? else {
      return Ok(None);
    };
    if item.status != expected {
      return Err(SyncError::InvalidStatus {
        id: id.to_string(),
        status: item.status.as_str(),
        expected: expected.as_str(),
      });
    }

    change(&mut item, self.clock.now());
    self.store.put(&item)?;
    debug!(id, status = %item.status, "sync item transitioned");
    Ok(Some(item))
  }

  pub fn mark_synced(&self, id: &str) -> Result<Option<SyncItem>, SyncError> {
    self.transition(id, SyncStatus::Syncing, |item, now| {
      item.set_status(SyncStatus::Synced, now);
      item.last_error = None;
      item.next_attempt_at = None;
    })
  }

  /// Record a failure. The item returns to `Pending` with a backoff delay
  /// until `max_retries` is exceeded, then stays `Failed`.
  pub fn mark_failed(&self, id: &str, reason: &str) -> Result<Option<SyncItem>, SyncError> {
    let retry = self.retry.clone();
    self.transition(id, SyncStatus::Syncing, |item, now| {
      item.retry_count += 1;
      item.last_error = Some(reason.to_string());

      if retry.allows(item.retry_count) {
        item.next_attempt_at = Some(now + to_chrono(retry.backoff(item.retry_count)));
        item.set_status(SyncStatus::Pending, now);
      } else {
        warn!(
          id = %item.id,
          retries = item.retry_count,
          reason,
          "sync item exhausted retries"
        );
        item.next_attempt_at = None;
        item.set_status(SyncStatus::Failed, now);
      }
    })
  }

  /// Record a conflict, keeping the local payload and the remote snapshot.
  pub fn mark_conflict(
    &self,
    id: &str,
    remote_snapshot: Option<serde_json::Value>,
  ) -> Result<Option<SyncItem>, SyncError> {
    self.transition(id, SyncStatus::Syncing, |item, now| {
      item.conflict_payload = remote_snapshot;
      item.set_status(SyncStatus::Conflict, now);
    })
  }

  /// Move a `Failed` item back to `Pending` with a fresh retry budget.
  pub fn retry_failed(&self, id: &str) -> Result<SyncItem, SyncError> {
    self
      .transition(id, SyncStatus::Failed, |item, now| {
        item.retry_count = 0;
        item.next_attempt_at = None;
        item.set_status(SyncStatus::Pending, now);
      })?
      .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))
  }

  /// Settle a conflict by keeping the local payload or adopting the remote one.
  pub fn resolve_conflict(&self, id: &str, use_local: bool) -> Result<Resolution, SyncError> {
    let _guard = self.guard();
    let now = self.clock.now();

    let mut item = self
      .store
      .get::<SyncItem>(id)?
      .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))?;
    if item.status != SyncStatus::Conflict {
      return Err(SyncError::InvalidStatus {
        id: id.to_string(),
        status: item.status.as_str(),
        expected: SyncStatus::Conflict.as_str(),
      });
    }

    if let Some(newer) = self.find_outstanding(&item.entity_type, &item.entity_id)? {
      item.last_error = Some(format!("superseded by {}", newer.id));
      item.set_status(SyncStatus::Synced, now);
      self.store.put(&item)?;
      return Ok(Resolution::Superseded { by: newer.id });
    }

    let resolution = if use_local {
      item.conflict_payload = None;
      item.retry_count = 0;
      item.next_attempt_at = None;
      item.last_error = None;
      item.set_status(SyncStatus::Pending, now);
      Resolution::Requeued {
        id: item.id.clone(),
      }
    } else {
      let snapshot = item.conflict_payload.take();
      item.payload = snapshot.clone();
      item.set_status(SyncStatus::Synced, now);
      Resolution::AdoptedRemote { snapshot }
    };

    self.store.put(&item)?;
    debug!(id, ?resolution, "conflict resolved");
    Ok(resolution)
  }

  /// Return `Syncing` items claimed longer than `timeout` ago to `Pending`.
  pub fn recover_stale(&self, timeout: Duration) -> Result<usize, SyncError> {
    let _guard = self.guard();
    let now = self.clock.now();
    let cutoff = now - to_chrono(timeout);

    let mut stale: Vec<SyncItem> = self
      .store
      .select::<SyncItem>(&by_status(SyncStatus::Syncing), usize::MAX)?
      .into_iter()
      .filter(|item| item.status_changed_at <= cutoff)
      .collect();

    for item in &mut stale {
      item.set_status(SyncStatus::Pending, now);
    }
    if !stale.is_empty() {
      self.store.batch(&stale, &[])?;
      warn!(count = stale.len(), "reclaimed stale syncing items");
    }
    Ok(stale.len())
  }

  /// Delete `Synced` items older than `retention`.
  pub fn prune_synced(&self, retention: Duration) -> Result<usize, SyncError> {
    let _guard = self.guard();
    let cutoff = self.clock.now() - to_chrono(retention);

    let ids = self
      .store
      .scan(|item: &SyncItem| {
        item.status == SyncStatus::Synced && item.status_changed_at <= cutoff
      })
      .map(|item| item.map(|i| i.id))
      .collect::<Result<Vec<String>, _>>()?;

    if !ids.is_empty() {
      let keys: Vec<&str> = ids.iter().map(String::as_str).collect();
      self.store.batch::<SyncItem>(&[], &keys)?;
      debug!(count = ids.len(), "pruned synced items");
    }
    Ok(ids.len())
  }

  /// Items with `status`, in id order. Each call starts a fresh scan.
  pub fn list_by_status(
    &self,
    status: SyncStatus,
  ) -> impl Iterator<Item = Result<SyncItem, StoreError>> + '_ {
    self
      .store
      .scan(move |item: &SyncItem| item.status == status)
  }

  pub fn counts(&self) -> Result<QueueCounts, SyncError> {
    let mut counts = QueueCounts::default();
    for item in self.store.scan(|_: &SyncItem| true) {
      counts.bump(item?.status);
    }
    Ok(counts)
  }
}
