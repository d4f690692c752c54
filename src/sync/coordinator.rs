//! Single-flight reconciliation between the sync queue and a remote.

use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::item::{SyncItem, SyncStatus};
use super::queue::{Resolution, SyncQueue};
use super::remote::{ApplyResult, RemoteService};
use super::session::{RunOutcome, SyncSession};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::shutdown::{Cancellation, ShutdownHandle};
use crate::store::EntryStore;

/// Closed sessions kept for reporting.
const SESSION_HISTORY: usize = 32;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
  Idle,
  Running,
}

/// Tuning for reconciliation runs.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
  pub batch_size: usize,
  /// Concurrent remote calls (1 = sequential)
  pub workers: usize,
  pub remote_timeout: Duration,
  /// Claims older than this are reclaimed at run start
  pub stale_claim: Duration,
}

impl Default for CoordinatorOptions {
  fn default() -> Self {
    Self::from(&SyncConfig::default())
  }
}

impl From<&SyncConfig> for CoordinatorOptions {
  fn from(config: &SyncConfig) -> Self {
    Self {
      batch_size: config.batch_size.max(1),
      workers: config.workers.max(1),
      remote_timeout: config.remote_timeout(),
      stale_claim: config.stale_claim(),
    }
  }
}

enum ItemOutcome {
  Marked(SyncStatus),
  Skipped,
  Superseded,
  Error,
}

/// Resets the coordinator to idle however a run ends.
struct RunningGuard<'a>(&'a AtomicU8);

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.0.store(IDLE, Ordering::SeqCst);
  }
}

/// Drives the sync queue against a [`RemoteService`].
///
/// Only one run is active at a time; a run requested while another is in
/// flight returns [`RunOutcome::AlreadyRunning`] immediately.
pub struct SyncCoordinator<S: EntryStore, R: RemoteService> {
  queue: Arc<SyncQueue<S>>,
  remote: Arc<R>,
  options: CoordinatorOptions,
  clock: Arc<dyn Clock>,
  state: AtomicU8,
  next_session: AtomicU64,
  sessions: Mutex<VecDeque<SyncSession>>,
}

impl<S: EntryStore, R: RemoteService> SyncCoordinator<S, R> {
  pub fn new(queue: Arc<SyncQueue<S>>, remote: Arc<R>) -> Self {
    Self {
      queue,
      remote,
      options: CoordinatorOptions::default(),
      clock: Arc::new(SystemClock),
      state: AtomicU8::new(IDLE),
      next_session: AtomicU64::new(1),
      sessions: Mutex::new(VecDeque::new()),
    }
  }

  pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
    self.options = CoordinatorOptions {
      batch_size: options.batch_size.max(1),
      workers: options.workers.max(1),
      ..options
    };
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn queue(&self) -> &Arc<SyncQueue<S>> {
    &self.queue
  }

  pub fn state(&self) -> CoordinatorState {
    match self.state.load(Ordering::SeqCst) {
      RUNNING => CoordinatorState::Running,
      _ => CoordinatorState::Idle,
    }
  }

  /// Closed sessions, oldest first.
  pub fn sessions(&self) -> Vec<SyncSession> {
    let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
    sessions.iter().cloned().collect()
  }

  /// Run one reconciliation pass.
  ///
  /// Storage errors while claiming abort the run; errors recording an
  /// individual result are logged and counted without stopping the batch.
  pub async fn run_once(&self, cancel: &Cancellation) -> Result<RunOutcome, SyncError> {
    if self
      .state
      .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("sync run already in flight");
      return Ok(RunOutcome::AlreadyRunning);
    }
    let _running = RunningGuard(&self.state);

    let id = self.next_session.fetch_add(1, Ordering::SeqCst);
    let mut session = SyncSession::open(id, self.clock.now());

    self.queue.recover_stale(self.options.stale_claim)?;
    let claimed = self.queue.dequeue_pending(self.options.batch_size)?;
    debug!(session = id, claimed = claimed.len(), "sync run started");

    let outcomes: Vec<(String, ItemOutcome)> = stream::iter(claimed)
      .map(move |item| async move {
        let id = item.id.clone();
        (id, self.process(item, cancel).await)
      })
      .buffer_unordered(self.options.workers)
      .collect()
      .await;

    for (item_id, outcome) in outcomes {
      match outcome {
        ItemOutcome::Marked(status) => session.summary.record(status),
        ItemOutcome::Skipped => {
          session.summary.skipped += 1;
          continue;
        }
        ItemOutcome::Superseded => session.summary.superseded += 1,
        ItemOutcome::Error => session.summary.errors += 1,
      }
      session.item_ids_processed.push(item_id);
    }

    let cancelled = cancel.is_cancelled();
    session.close(self.clock.now(), cancelled);
    let summary = &session.summary;
    info!(
      session = id,
      synced = summary.synced,
      conflict = summary.conflict,
      retrying = summary.retrying,
      failed = summary.failed,
      skipped = summary.skipped,
      cancelled,
      "sync run finished"
    );

    {
      let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
      if sessions.len() == SESSION_HISTORY {
        sessions.pop_front();
      }
      sessions.push_back(session.clone());
    }

    if cancelled {
      Ok(RunOutcome::Cancelled(session))
    } else {
      Ok(RunOutcome::Completed(session))
    }
  }

  async fn process(&self, item: SyncItem, cancel: &Cancellation) -> ItemOutcome {
    if cancel.is_cancelled() {
      return ItemOutcome::Skipped;
    }

    let timeout = self.options.remote_timeout;
    let call = self.remote.apply(
      &item.entity_type,
      &item.entity_id,
      item.operation,
      item.payload.as_ref(),
      timeout,
    );
    let result = match tokio::time::timeout(timeout, call).await {
      Ok(result) => result,
      Err(_) => ApplyResult::Failure(format!("timed out after {:?}", timeout)),
    };

    let marked = match result {
      ApplyResult::Applied(_) => self.queue.mark_synced(&item.id),
      ApplyResult::Conflict(snapshot) => {
        debug!(id = %item.id, "remote reported conflict");
        self.queue.mark_conflict(&item.id, snapshot)
      }
      ApplyResult::Failure(reason) => {
        debug!(id = %item.id, %reason, "remote apply failed");
        self.queue.mark_failed(&item.id, &reason)
      }
    };

    match marked {
      Ok(Some(updated)) => ItemOutcome::Marked(updated.status),
      Ok(None) => ItemOutcome::Superseded,
      Err(e) => {
        warn!(id = %item.id, error = %e, "failed to record sync result");
        ItemOutcome::Error
      }
    }
  }

  /// Settle a conflicted item: `use_local` re-queues the local payload,
  /// otherwise the remote snapshot is adopted and returned for the caller
  /// to apply locally.
  pub fn resolve_conflict(&self, id: &str, use_local: bool) -> Result<Resolution, SyncError> {
    self.queue.resolve_conflict(id, use_local)
  }
}

impl<S, R> SyncCoordinator<S, R>
where
  S: EntryStore + 'static,
  R: RemoteService + 'static,
{
  /// Run reconciliation every `interval` on a background task. Manual runs
  /// that overlap a tick collapse into whichever started first.
  pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> ShutdownHandle {
    let coordinator = Arc::clone(self);
    ShutdownHandle::spawn_periodic("sync-coordinator", interval, move |cancel| {
      let coordinator = Arc::clone(&coordinator);
      async move {
        if let Err(e) = coordinator.run_once(&cancel).await {
          warn!(error = %e, "sync run failed");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use crate::sync::{Operation, RetryPolicy};
  use async_trait::async_trait;
  use serde_json::json;

  /// Answers every call with the same result.
  struct FixedRemote(ApplyResult);

  #[async_trait]
  impl RemoteService for FixedRemote {
    async fn apply(
      &self,
      _entity_type: &str,
      _entity_id: &str,
      _operation: Operation,
      _payload: Option<&serde_json::Value>,
      _timeout: Duration,
    ) -> ApplyResult {
      self.0.clone()
    }
  }

  /// Cancels the run on its first call, which still succeeds.
  struct CancellingRemote {
    cancel: Cancellation,
    calls: AtomicU64,
  }

  #[async_trait]
  impl RemoteService for CancellingRemote {
    async fn apply(
      &self,
      _entity_type: &str,
      _entity_id: &str,
      _operation: Operation,
      _payload: Option<&serde_json::Value>,
      _timeout: Duration,
    ) -> ApplyResult {
      if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
        self.cancel.cancel();
      }
      ApplyResult::Applied(None)
    }
  }

  /// Succeeds after a delay.
  struct SlowRemote(Duration);

  #[async_trait]
  impl RemoteService for SlowRemote {
    async fn apply(
      &self,
      _entity_type: &str,
      _entity_id: &str,
      _operation: Operation,
      _payload: Option<&serde_json::Value>,
      _timeout: Duration,
    ) -> ApplyResult {
      tokio::time::sleep(self.0).await;
      ApplyResult::Applied(None)
    }
  }

  /// Never answers.
  struct HangingRemote;

  #[async_trait]
  impl RemoteService for HangingRemote {
    async fn apply(
      &self,
      _entity_type: &str,
      _entity_id: &str,
      _operation: Operation,
      _payload: Option<&serde_json::Value>,
      _timeout: Duration,
    ) -> ApplyResult {
      std::future::pending().await
    }
  }

  fn queue(clock: &ManualClock) -> Arc<SyncQueue<MemoryStore>> {
    Arc::new(
      SyncQueue::new(Arc::new(MemoryStore::new()))
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
        .with_retry_policy(RetryPolicy::immediate(3)),
    )
  }

  #[tokio::test]
  async fn test_applied_items_are_synced() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    q.enqueue("note", "1", Operation::Create, Some(json!({"t": 1}))).unwrap();
    q.enqueue("note", "2", Operation::Create, Some(json!({"t": 2}))).unwrap();

    let remote = Arc::new(FixedRemote(ApplyResult::Applied(None)));
    let coordinator = SyncCoordinator::new(Arc::clone(&q), remote);
    let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();

    let RunOutcome::Completed(session) = outcome else {
      panic!("expected completed run");
    };
    assert_eq!(session.summary.synced, 2);
    assert_eq!(session.item_ids_processed.len(), 2);
    assert!(session.ended_at.is_some());
    assert_eq!(q.counts().unwrap().synced, 2);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
  }

  #[tokio::test]
  async fn test_failure_returns_item_to_pending() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    q.enqueue("note", "1", Operation::Update, None).unwrap();

    let remote = Arc::new(FixedRemote(ApplyResult::Failure("503".into())));
    let coordinator = SyncCoordinator::new(Arc::clone(&q), remote);
    let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();

    assert_eq!(outcome.session().unwrap().summary.retrying, 1);
    let item = q.outstanding_for("note", "1").unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.last_error.as_deref(), Some("503"));
  }

  #[tokio::test]
  async fn test_timeout_counts_as_failure() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    q.enqueue("note", "1", Operation::Update, None).unwrap();

    let coordinator = SyncCoordinator::new(Arc::clone(&q), Arc::new(HangingRemote)).with_options(
      CoordinatorOptions {
        remote_timeout: Duration::from_millis(10),
        ..CoordinatorOptions::default()
      },
    );
    let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();

    assert_eq!(outcome.session().unwrap().summary.retrying, 1);
    let item = q.outstanding_for("note", "1").unwrap().unwrap();
    assert!(item.last_error.unwrap().contains("timed out"));
  }

  #[tokio::test]
  async fn test_cancelled_run_leaves_claims_syncing() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    q.enqueue("note", "1", Operation::Update, None).unwrap();

    let remote = Arc::new(FixedRemote(ApplyResult::Applied(None)));
    let coordinator = SyncCoordinator::new(Arc::clone(&q), remote);
    let cancel = Cancellation::new();
    cancel.cancel();

    let outcome = coordinator.run_once(&cancel).await.unwrap();
    let RunOutcome::Cancelled(session) = outcome else {
      panic!("expected cancelled run");
    };
    assert_eq!(session.summary.skipped, 1);
    assert!(session.item_ids_processed.is_empty());
    assert_eq!(q.counts().unwrap().syncing, 1);

    // A later run reclaims the stale claim once the timeout passes
    clock.advance(chrono::Duration::seconds(301));
    let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
    assert_eq!(outcome.session().unwrap().summary.synced, 1);
  }

  #[tokio::test]
  async fn test_cancel_between_items_skips_the_rest() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    q.enqueue("note", "1", Operation::Update, None).unwrap();
    q.enqueue("note", "2", Operation::Update, None).unwrap();

    let cancel = Cancellation::new();
    let remote = Arc::new(CancellingRemote {
      cancel: cancel.clone(),
      calls: AtomicU64::new(0),
    });
    let coordinator = SyncCoordinator::new(Arc::clone(&q), Arc::clone(&remote)).with_options(
      CoordinatorOptions {
        workers: 1,
        ..CoordinatorOptions::default()
      },
    );

    let outcome = coordinator.run_once(&cancel).await.unwrap();
    let RunOutcome::Cancelled(session) = outcome else {
      panic!("expected cancelled run");
    };
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.summary.synced, 1);
    assert_eq!(session.summary.skipped, 1);
    assert_eq!(session.item_ids_processed.len(), 1);

    let counts = q.counts().unwrap();
    assert_eq!(counts.synced, 1);
    assert_eq!(counts.syncing, 1);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
  }

  #[tokio::test]
  async fn test_manual_run_during_periodic_tick_is_rejected() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    q.enqueue("note", "1", Operation::Update, None).unwrap();

    let remote = Arc::new(SlowRemote(Duration::from_millis(100)));
    let coordinator = Arc::new(SyncCoordinator::new(Arc::clone(&q), remote));

    // The first tick fires immediately and holds the run for the remote delay
    let handle = coordinator.spawn_periodic(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.state(), CoordinatorState::Running);

    let manual = coordinator.run_once(&Cancellation::new()).await.unwrap();
    assert!(matches!(manual, RunOutcome::AlreadyRunning));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    let sessions = coordinator.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].summary.synced, 1);
    assert_eq!(q.counts().unwrap().synced, 1);

    handle.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_session_history_is_bounded() {
    let clock = ManualClock::default();
    let q = queue(&clock);
    let coordinator = SyncCoordinator::new(q, Arc::new(FixedRemote(ApplyResult::Applied(None))));

    for _ in 0..(SESSION_HISTORY + 3) {
      coordinator.run_once(&Cancellation::new()).await.unwrap();
    }

    let sessions = coordinator.sessions();
    assert_eq!(sessions.len(), SESSION_HISTORY);
    assert_eq!(sessions[0].id, 4);
  }
}
