use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::shutdown::ShutdownHandle;
use crate::store::SqliteStore;
use crate::sync::{CoordinatorOptions, HttpRemote, SyncCoordinator, SyncQueue};

/// Cache, queue and coordinator sharing one durable store.
pub struct App {
  config: Config,
  store: Arc<SqliteStore>,
  cache: Arc<CacheManager<SqliteStore>>,
  queue: Arc<SyncQueue<SqliteStore>>,
}

impl App {
  /// Open the database at `db_path`.
  pub fn open_at(config: Config, db_path: &Path) -> Result<Self> {
    let store = Arc::new(
      SqliteStore::open(db_path)
        .map_err(|e| eyre!("Failed to open database {}: {}", db_path.display(), e))?,
    );
    info!(path = %db_path.display(), "opened store");
    Self::with_store(config, store)
  }

  pub fn with_store(config: Config, store: Arc<SqliteStore>) -> Result<Self> {
    let cache = Arc::new(
      CacheManager::new(Arc::clone(&store))
        .with_strategy(config.cache.strategy)
        .with_default_ttl(config.cache.default_ttl()),
    );
    let queue = Arc::new(
      SyncQueue::new(Arc::clone(&store))?.with_retry_policy(config.sync.retry_policy()),
    );

    Ok(Self {
      config,
      store,
      cache,
      queue,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &Arc<SqliteStore> {
    &self.store
  }

  pub fn cache(&self) -> &Arc<CacheManager<SqliteStore>> {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<SyncQueue<SqliteStore>> {
    &self.queue
  }

  /// Coordinator against the configured HTTP remote.
  pub fn coordinator(&self) -> Result<SyncCoordinator<SqliteStore, HttpRemote>> {
    let url = self
      .config
      .remote
      .url
      .as_deref()
      .ok_or_else(|| eyre!("remote.url is not configured"))?;
    let remote = HttpRemote::new(url, self.config.remote_token())?;

    Ok(
      SyncCoordinator::new(Arc::clone(&self.queue), Arc::new(remote))
        .with_options(CoordinatorOptions::from(&self.config.sync)),
    )
  }

  /// Start the periodic cache sweeper and, when a remote is configured, the
  /// periodic sync loop.
  pub fn spawn_background(&self) -> Result<Vec<ShutdownHandle>> {
    let mut handles = vec![self.cache.spawn_sweeper(self.config.cache.sweep_interval())];
    if self.config.remote.url.is_some() {
      let coordinator = Arc::new(self.coordinator()?);
      handles.push(coordinator.spawn_periodic(self.config.sync.interval()));
    }
    Ok(handles)
  }
}
