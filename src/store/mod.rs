//! Durable key-value persistence for cache entries and sync items.
//!
//! Both tables live behind the [`EntryStore`] trait:
//! - `SqliteStore` keeps them in an SQLite file with an explicit column per field
//! - `MemoryStore` keeps serialized records in ordered maps
//!
//! Scans page through a table in key order and are re-invocable.

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
  column, format_time, opt_text, parse_time, text, EntryStore, Query, Record, Scan, Table,
  SCAN_PAGE_SIZE,
};
