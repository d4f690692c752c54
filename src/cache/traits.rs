//! Core types for the caching system.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which tiers a cache write goes to and a read consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
  /// Memory tier only; nothing survives a restart
  MemoryOnly,
  /// Entry store only; every read hits the store
  DurableOnly,
  /// Both tiers; reads are served from memory and repopulated from the store
  #[default]
  Hybrid,
}

impl CacheStrategy {
  pub fn uses_memory(&self) -> bool {
    matches!(self, Self::MemoryOnly | Self::Hybrid)
  }

  pub fn uses_durable(&self) -> bool {
    matches!(self, Self::DurableOnly | Self::Hybrid)
  }
}

/// Result of a cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  /// Written to every tier the strategy uses
  Stored,
  /// Memory tier updated, durable tier write failed
  Degraded { reason: String },
}

impl WriteOutcome {
  pub fn is_degraded(&self) -> bool {
    matches!(self, Self::Degraded { .. })
  }
}

/// Entries removed by a sweep, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub memory: usize,
  pub durable: usize,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub memory_hits: u64,
  pub durable_hits: u64,
  pub misses: u64,
  pub expirations: u64,
  pub degraded_writes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
  pub memory_hits: AtomicU64,
  pub durable_hits: AtomicU64,
  pub misses: AtomicU64,
  pub expirations: AtomicU64,
  pub degraded_writes: AtomicU64,
}

impl Counters {
  pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      memory_hits: self.memory_hits.load(Ordering::Relaxed),
      durable_hits: self.durable_hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      expirations: self.expirations.load(Ordering::Relaxed),
      degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
    }
  }
}
