//! Subcommands of the `offcache` binary.

use clap::{ArgGroup, Subcommand};
use color_eyre::Result;
use tracing::{info, warn};

use offcache::cache::CacheEntry;
use offcache::shutdown::Cancellation;
use offcache::store::EntryStore;
use offcache::sync::{Resolution, RunOutcome, SyncItem, SyncStatus};
use offcache::App;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Queue counts per status and cache size
  Status,
  /// List sync items with a status
  Items {
    /// pending, syncing, synced, conflict or failed
    status: SyncStatus,
  },
  /// Move a failed item back to pending
  Retry { id: String },
  /// Settle a conflicted item
  #[command(group(ArgGroup::new("side").required(true).args(["local", "remote"])))]
  Resolve {
    id: String,
    /// Re-queue the local mutation
    #[arg(long)]
    local: bool,
    /// Keep the remote state
    #[arg(long)]
    remote: bool,
  },
  /// Remove expired cache entries
  Sweep,
  /// Remove synced items past the retention window
  Prune,
  /// Run one reconciliation pass against the configured remote
  Sync,
  /// Sweep and sync periodically until interrupted
  Daemon,
}

pub async fn run(app: &App, command: Command) -> Result<()> {
  match command {
    Command::Status => status(app),
    Command::Items { status } => items(app, status),
    Command::Retry { id } => {
      let item = app.queue().retry_failed(&id)?;
      println!("{} is {} again", item.id, item.status);
      Ok(())
    }
    Command::Resolve { id, local, .. } => resolve(app, &id, local),
    Command::Sweep => {
      let report = app.cache().sweep_expired()?;
      println!(
        "removed {} expired entries ({} from memory)",
        report.durable, report.memory
      );
      Ok(())
    }
    Command::Prune => {
      let removed = app
        .queue()
        .prune_synced(app.config().sync.synced_retention())?;
      println!("pruned {} synced items", removed);
      Ok(())
    }
    Command::Sync => sync(app).await,
    Command::Daemon => daemon(app).await,
  }
}

fn status(app: &App) -> Result<()> {
  let counts = app.queue().counts()?;
  for status in SyncStatus::ALL {
    println!("{:<10} {}", status.as_str(), counts.get(status));
  }

  let mut entries = 0;
  for entry in app.store().scan(|_: &CacheEntry| true) {
    entry?;
    entries += 1;
  }
  println!("{:<10} {}", "cached", entries);
  Ok(())
}

fn items(app: &App, status: SyncStatus) -> Result<()> {
  for item in app.queue().list_by_status(status) {
    print_item(&item?);
  }
  Ok(())
}

fn print_item(item: &SyncItem) {
  let error = item.last_error.as_deref().unwrap_or("");
  println!(
    "{}  {:<6} {}/{}  retries={} {}",
    item.id,
    item.operation.as_str(),
    item.entity_type,
    item.entity_id,
    item.retry_count,
    error
  );
}

fn resolve(app: &App, id: &str, use_local: bool) -> Result<()> {
  match app.queue().resolve_conflict(id, use_local)? {
    Resolution::Requeued { id } => println!("re-queued as {}", id),
    Resolution::AdoptedRemote { snapshot } => match snapshot {
      Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
      None => println!("kept remote state"),
    },
    Resolution::Superseded { by } => println!("already superseded by {}", by),
  }
  Ok(())
}

async fn sync(app: &App) -> Result<()> {
  let coordinator = app.coordinator()?;
  let cancel = Cancellation::new();

  let run = coordinator.run_once(&cancel);
  tokio::pin!(run);

  // Ctrl-C stops the run between items; in-flight calls still finish
  let outcome = tokio::select! {
    outcome = &mut run => outcome?,
    _ = tokio::signal::ctrl_c() => {
      cancel.cancel();
      run.await?
    }
  };

  match outcome {
    RunOutcome::AlreadyRunning => println!("a sync run is already in progress"),
    RunOutcome::Completed(session) | RunOutcome::Cancelled(session) => {
      let s = session.summary;
      println!(
        "synced={} conflict={} retrying={} failed={} superseded={} errors={}",
        s.synced, s.conflict, s.retrying, s.failed, s.superseded, s.errors
      );
    }
  }
  Ok(())
}

async fn daemon(app: &App) -> Result<()> {
  let handles = app.spawn_background()?;
  info!(tasks = handles.len(), "background tasks started");

  tokio::signal::ctrl_c().await?;
  info!("shutting down");
  for handle in handles {
    if let Err(e) = handle.shutdown().await {
      warn!(error = %e, "background task failed");
    }
  }
  Ok(())
}
