//! Two-tier cache for locally held data.
//!
//! This module provides a cache that:
//! - Keeps entries in a memory tier, the entry store, or both (`CacheStrategy`)
//! - Expires entries by TTL, lazily on read and proactively via a sweep
//! - Falls back to the memory tier when the durable tier is unavailable

mod entry;
mod manager;
mod traits;

pub use entry::CacheEntry;
pub use manager::CacheManager;
pub use traits::{CacheStats, CacheStrategy, SweepReport, WriteOutcome};
