//! Offline-capable local cache with expiration and a durable sync queue.
//!
//! The pieces compose bottom-up: an [`store::EntryStore`] persists records,
//! [`cache::CacheManager`] layers memory and durable tiers with TTLs on top,
//! [`sync::SyncQueue`] records local mutations, and
//! [`sync::SyncCoordinator`] replays them against a [`sync::RemoteService`].
//! [`App`] wires all of it from a [`config::Config`].

mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod shutdown;
pub mod store;
pub mod sync;

pub use app::App;
