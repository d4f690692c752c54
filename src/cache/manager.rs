//! Two-tier cache with per-entry expiration.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::traits::{CacheStats, CacheStrategy, Counters, SweepReport, WriteOutcome};
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::CacheError;
use crate::shutdown::ShutdownHandle;
use crate::store::EntryStore;

type MemoryTier = HashMap<String, Arc<CacheEntry>>;

/// Cache manager that keeps entries in memory and/or the entry store.
///
/// Memory-tier writes swap a whole `Arc<CacheEntry>`, so a concurrent reader
/// sees either the old entry or the new one.
pub struct CacheManager<S: EntryStore> {
  store: Arc<S>,
  memory: RwLock<MemoryTier>,
  strategy: CacheStrategy,
  default_ttl: Duration,
  clock: Arc<dyn Clock>,
  counters: Counters,
}

impl<S: EntryStore> CacheManager<S> {
  /// Create a hybrid cache with a five minute default TTL.
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      memory: RwLock::new(HashMap::new()),
      strategy: CacheStrategy::Hybrid,
      default_ttl: Duration::from_secs(300),
      clock: Arc::new(SystemClock),
      counters: Counters::default(),
    }
  }

  pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn strategy(&self) -> CacheStrategy {
    self.strategy
  }

  pub fn stats(&self) -> CacheStats {
    self.counters.snapshot()
  }

  fn read_memory(&self) -> RwLockReadGuard<'_, MemoryTier> {
    self.memory.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write_memory(&self) -> RwLockWriteGuard<'_, MemoryTier> {
    self.memory.write().unwrap_or_else(PoisonError::into_inner)
  }

  /// Store `value` under `key` for `ttl`, replacing any existing entry.
  /// TTLs longer than 100 years are capped.
  pub fn put(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Duration,
  ) -> Result<WriteOutcome, CacheError> {
    if ttl.is_zero() {
      return Err(CacheError::InvalidTtl);
    }
    let now = self.clock.now();
    // Stored timestamps keep microseconds
    let ttl = to_chrono(ttl).max(chrono::Duration::microseconds(1));
    let expires_at = now
      .checked_add_signed(ttl)
      .ok_or(CacheError::InvalidTtl)?;
    let entry = CacheEntry::new(key, value, now, expires_at);

    match self.strategy {
      CacheStrategy::MemoryOnly => {
        self.write_memory().insert(entry.key.clone(), Arc::new(entry));
        Ok(WriteOutcome::Stored)
      }
      CacheStrategy::DurableOnly => {
        self.store.put(&entry)?;
        Ok(WriteOutcome::Stored)
      }
      CacheStrategy::Hybrid => {
        let entry = Arc::new(entry);
        self
          .write_memory()
          .insert(entry.key.clone(), Arc::clone(&entry));

        match self.store.put(&*entry) {
          Ok(()) => Ok(WriteOutcome::Stored),
          Err(e) => {
            warn!(key, error = %e, "durable cache write failed, kept in memory only");
            Counters::bump(&self.counters.degraded_writes);
            Ok(WriteOutcome::Degraded {
              reason: e.to_string(),
            })
          }
        }
      }
    }
  }

  /// Store `value` under `key` with the default TTL.
  pub fn put_default(&self, key: &str, value: Vec<u8>) -> Result<WriteOutcome, CacheError> {
    self.put(key, value, self.default_ttl)
  }

  /// Serialize `value` as JSON and store it.
  pub fn put_json<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    ttl: Duration,
  ) -> Result<WriteOutcome, CacheError> {
    let data = serde_json::to_vec(value)?;
    self.put(key, data, ttl)
  }

  /// Look up `key`. Expired entries are evicted and reported absent.
  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    Ok(self.lookup(key)?.map(|entry| entry.value.clone()))
  }

  /// Look up `key` and deserialize the JSON value.
  pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
    match self.lookup(key)? {
      Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
      None => Ok(None),
    }
  }

  pub fn contains(&self, key: &str) -> Result<bool, CacheError> {
    Ok(self.lookup(key)?.is_some())
  }

  fn lookup(&self, key: &str) -> Result<Option<Arc<CacheEntry>>, CacheError> {
    let now = self.clock.now();

    if self.strategy.uses_memory() {
      let hit = self.read_memory().get(key).cloned();
      if let Some(entry) = hit {
        if !entry.is_expired(now) {
          Counters::bump(&self.counters.memory_hits);
          return Ok(Some(entry));
        }
        self.evict_expired(&entry, now);
        return Ok(None);
      }
    }

    if !self.strategy.uses_durable() {
      Counters::bump(&self.counters.misses);
      return Ok(None);
    }

    match self.store.get::<CacheEntry>(key)? {
      Some(entry) if entry.is_expired(now) => {
        self.evict_expired(&entry, now);
        Ok(None)
      }
      Some(entry) => {
        Counters::bump(&self.counters.durable_hits);
        if !self.strategy.uses_memory() {
          return Ok(Some(Arc::new(entry)));
        }
        // A put that landed while the store was being read wins
        let mut memory = self.write_memory();
        let current = memory
          .entry(key.to_string())
          .or_insert_with(|| Arc::new(entry));
        Ok(Some(Arc::clone(current)))
      }
      None => {
        Counters::bump(&self.counters.misses);
        Ok(None)
      }
    }
  }

  /// Drop an entry found expired during a read, from both tiers.
  ///
  /// Each tier only drops its copy if that copy is still expired, so a
  /// concurrent put survives. A failed durable delete is left for the sweeper.
  fn evict_expired(&self, expired: &CacheEntry, now: DateTime<Utc>) {
    Counters::bump(&self.counters.expirations);
    debug!(key = %expired.key, "evicting expired cache entry");

    if self.strategy.uses_memory() {
      let mut memory = self.write_memory();
      if memory
        .get(&expired.key)
        .is_some_and(|current| current.is_expired(now))
      {
        memory.remove(&expired.key);
      }
    }

    if self.strategy.uses_durable() {
      let still_expired = |current: &CacheEntry| current.is_expired(now);
      if let Err(e) = self
        .store
        .delete_where::<CacheEntry, _>(&[expired.key.as_str()], still_expired)
      {
        warn!(key = %expired.key, error = %e, "failed to evict expired entry from store");
      }
    }
  }

  /// Remove `key` from both tiers. Removing a missing key succeeds.
  pub fn remove(&self, key: &str) -> Result<(), CacheError> {
    if self.strategy.uses_memory() {
      self.write_memory().remove(key);
    }
    if self.strategy.uses_durable() {
      self.store.delete::<CacheEntry>(key)?;
    }
    Ok(())
  }

  /// Remove every entry from both tiers.
  pub fn clear(&self) -> Result<(), CacheError> {
    if self.strategy.uses_memory() {
      self.write_memory().clear();
    }
    if self.strategy.uses_durable() {
      self.store.clear::<CacheEntry>()?;
    }
    Ok(())
  }

  /// Remove all expired entries from both tiers.
  pub fn sweep_expired(&self) -> Result<SweepReport, CacheError> {
    let now = self.clock.now();
    let mut report = SweepReport::default();

    if self.strategy.uses_memory() {
      let mut memory = self.write_memory();
      let before = memory.len();
      memory.retain(|_, entry| !entry.is_expired(now));
      report.memory = before - memory.len();
    }

    if self.strategy.uses_durable() {
      let expired = self
        .store
        .scan(|entry: &CacheEntry| entry.is_expired(now))
        .map(|entry| entry.map(|e| e.key))
        .collect::<Result<Vec<String>, _>>()?;

      if !expired.is_empty() {
        // Entries rewritten since the scan are kept
        let keys: Vec<&str> = expired.iter().map(String::as_str).collect();
        report.durable = self
          .store
          .delete_where::<CacheEntry, _>(&keys, |current| current.is_expired(now))?;
      }
    }

    if report.memory > 0 || report.durable > 0 {
      debug!(
        memory = report.memory,
        durable = report.durable,
        "swept expired cache entries"
      );
    }
    Ok(report)
  }

  /// Number of live entries in the memory tier.
  pub fn memory_len(&self) -> usize {
    let now = self.clock.now();
    self
      .read_memory()
      .values()
      .filter(|entry| !entry.is_expired(now))
      .count()
  }
}

impl<S: EntryStore + 'static> CacheManager<S> {
  /// Sweep expired entries every `interval` on a background task.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> ShutdownHandle {
    let cache = Arc::clone(self);
    ShutdownHandle::spawn_periodic("cache-sweeper", interval, move |_| {
      let cache = Arc::clone(&cache);
      async move {
        let result = tokio::task::spawn_blocking(move || cache.sweep_expired()).await;
        match result {
          Ok(Ok(_)) => {}
          Ok(Err(e)) => warn!(error = %e, "cache sweep failed"),
          Err(e) => warn!(error = %e, "cache sweep task panicked"),
        }
      }
    })
  }
}
