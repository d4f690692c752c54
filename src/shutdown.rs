//! Cooperative cancellation and background task handles.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// Cooperative cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
  cancelled: Arc<AtomicBool>,
}

impl Cancellation {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

/// Handle to a periodic background task.
///
/// Dropping the handle leaves the task running; call [`shutdown`](Self::shutdown)
/// to stop it and wait for the current tick to finish.
pub struct ShutdownHandle {
  stop: watch::Sender<bool>,
  cancel: Cancellation,
  join: JoinHandle<()>,
}

impl ShutdownHandle {
  /// Run `tick` every `interval` until shut down. The first tick fires
  /// immediately. Each tick receives the task's cancellation flag.
  /// A zero interval is raised to one millisecond.
  pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
  where
    F: FnMut(Cancellation) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (stop, mut stopped) = watch::channel(false);
    let cancel = Cancellation::new();
    let task_cancel = cancel.clone();
    let interval = interval.max(Duration::from_millis(1));

    let join = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          _ = ticker.tick() => tick(task_cancel.clone()).await,
          _ = stopped.changed() => break,
        }
      }
      debug!(task = name, "background task stopped");
    });

    Self { stop, cancel, join }
  }

  /// Signal the task to stop, cancel any in-flight work and wait for it.
  /// Fails if the task panicked.
  pub async fn shutdown(self) -> Result<(), JoinError> {
    self.cancel.cancel();
    let _ = self.stop.send(true);
    self.join.await
  }
}
