use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheStrategy;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub remote: RemoteConfig,
  pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Which tiers a write goes to
  pub strategy: CacheStrategy,
  /// TTL applied by `put_default`
  pub default_ttl_secs: u64,
  /// How often the background sweeper removes expired entries
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      strategy: CacheStrategy::Hybrid,
      default_ttl_secs: 300,
      sweep_interval_secs: 60,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Maximum number of items claimed per reconciliation run
  pub batch_size: usize,
  /// Failures tolerated before an item stays `Failed`
  pub max_retries: u32,
  /// Concurrent remote calls within a run (1 = sequential)
  pub workers: usize,
  pub remote_timeout_ms: u64,
  /// `Syncing` items older than this are reclaimed at run start
  pub stale_claim_secs: u64,
  /// How long `Synced` items are kept before pruning
  pub synced_retention_secs: u64,
  /// Period of the background reconciliation loop
  pub interval_secs: u64,
  pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      batch_size: 50,
      max_retries: 5,
      workers: 1,
      remote_timeout_ms: 10_000,
      stale_claim_secs: 300,
      synced_retention_secs: 86_400,
      interval_secs: 30,
      backoff: BackoffConfig::default(),
    }
  }
}

impl SyncConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries,
      initial: Duration::from_millis(self.backoff.initial_ms),
      max: Duration::from_millis(self.backoff.max_ms),
      factor: self.backoff.factor,
    }
  }

  pub fn remote_timeout(&self) -> Duration {
    Duration::from_millis(self.remote_timeout_ms)
  }

  pub fn stale_claim(&self) -> Duration {
    Duration::from_secs(self.stale_claim_secs)
  }

  pub fn synced_retention(&self) -> Duration {
    Duration::from_secs(self.synced_retention_secs)
  }

  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
  pub initial_ms: u64,
  pub max_ms: u64,
  pub factor: f64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      initial_ms: 1_000,
      max_ms: 300_000,
      factor: 2.0,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the HTTP remote (e.g. "https://api.example.com/v1/")
  pub url: Option<String>,
  /// Name of the environment variable holding the bearer token
  pub token_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  /// Database file (defaults to $XDG_DATA_HOME/offcache/offcache.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.batch_size == 0 {
      return Err(eyre!("sync.batch_size must be greater than zero"));
    }
    if self.sync.workers == 0 {
      return Err(eyre!("sync.workers must be greater than zero"));
    }
    if self.cache.default_ttl_secs == 0 {
      return Err(eyre!("cache.default_ttl_secs must be greater than zero"));
    }
    if self.sync.backoff.factor < 1.0 {
      return Err(eyre!("sync.backoff.factor must be at least 1.0"));
    }
    if self.cache.sweep_interval_secs == 0 {
      return Err(eyre!("cache.sweep_interval_secs must be greater than zero"));
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be greater than zero"));
    }
    if self.sync.remote_timeout_ms == 0 {
      return Err(eyre!("sync.remote_timeout_ms must be greater than zero"));
    }
    Ok(())
  }

  /// Resolve the database file location.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("offcache.db"))
  }

  /// Read the remote bearer token from the configured environment variable.
  pub fn remote_token(&self) -> Option<String> {
    self
      .remote
      .token_env
      .as_deref()
      .and_then(|name| std::env::var(name).ok())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.strategy, CacheStrategy::Hybrid);
    assert_eq!(config.sync.batch_size, 50);
    assert_eq!(config.sync.workers, 1);
    assert!(config.remote.url.is_none());
  }

  #[test]
  fn test_partial_sections() {
    let yaml = "\
cache:
  strategy: memory_only
  default_ttl_secs: 10
sync:
  max_retries: 2
  backoff:
    factor: 3.0
";
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.cache.strategy, CacheStrategy::MemoryOnly);
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(10));
    assert_eq!(config.cache.sweep_interval_secs, 60);
    assert_eq!(config.sync.max_retries, 2);
    assert_eq!(config.sync.backoff.factor, 3.0);
    assert_eq!(config.sync.backoff.initial_ms, 1_000);
  }

  #[test]
  fn test_validation_rejects_zero_batch() {
    let config = Config::parse("sync:\n  batch_size: 0\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validation_rejects_zero_intervals() {
    for yaml in [
      "cache:\n  sweep_interval_secs: 0\n",
      "sync:\n  interval_secs: 0\n",
      "sync:\n  remote_timeout_ms: 0\n",
    ] {
      let config = Config::parse(yaml).unwrap();
      assert!(config.validate().is_err(), "accepted {yaml:?}");
    }
  }

  #[test]
  fn test_defaults_pass_validation() {
    Config::parse("{}").unwrap().validate().unwrap();
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_explicit_database_path() {
    let config = Config::parse("database:\n  path: /tmp/x.db\n").unwrap();
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/x.db"));
  }
}
