mod commands;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use offcache::config::Config;
use offcache::App;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Inspect and maintain an offline cache and its sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to a daily file next to the database, and to stderr when verbose.
/// The returned guard flushes the file writer on drop.
fn init_logging(db_path: &Path, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .ok_or_else(|| eyre!("Database path has no parent: {}", db_path.display()))?
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log dir {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "offcache.log"));

  let filter =
    EnvFilter::try_from_env("OFFCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .with(stderr)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;

  let _guard = init_logging(&db_path, args.verbose)?;

  let app = App::open_at(config, &db_path)?;
  commands::run(&app, args.command).await
}
