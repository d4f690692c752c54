//! End-to-end queue and coordinator behavior against a scripted remote.

use async_trait::async_trait;
use offcache::clock::ManualClock;
use offcache::shutdown::Cancellation;
use offcache::store::{MemoryStore, SqliteStore};
use offcache::sync::{
  ApplyResult, CoordinatorOptions, Operation, RemoteService, Resolution, RetryPolicy,
  RunOutcome, SyncCoordinator, SyncQueue, SyncStatus,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Replies per entity id (default `Applied`), optionally after a delay, and
/// records every call.
#[derive(Default)]
struct ScriptedRemote {
  replies: Mutex<HashMap<String, ApplyResult>>,
  calls: Mutex<Vec<(String, Operation, Option<Value>)>>,
  delay: Option<Duration>,
  in_flight: AtomicUsize,
  peak_in_flight: AtomicUsize,
}

impl ScriptedRemote {
  fn slow(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::default()
    }
  }

  fn reply(&self, entity_id: &str, result: ApplyResult) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(entity_id.to_string(), result);
  }

  fn calls(&self) -> Vec<(String, Operation, Option<Value>)> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
  async fn apply(
    &self,
    _entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: Option<&Value>,
    _timeout: Duration,
  ) -> ApplyResult {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

    self
      .calls
      .lock()
      .unwrap()
      .push((entity_id.to_string(), operation, payload.cloned()));
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    self
      .replies
      .lock()
      .unwrap()
      .get(entity_id)
      .cloned()
      .unwrap_or(ApplyResult::Applied(None))
  }
}

fn no_backoff(max_retries: u32) -> RetryPolicy {
  RetryPolicy {
    max_retries,
    initial: Duration::ZERO,
    max: Duration::ZERO,
    factor: 1.0,
  }
}

fn memory_queue(clock: &ManualClock, retry: RetryPolicy) -> Arc<SyncQueue<MemoryStore>> {
  Arc::new(
    SyncQueue::new(Arc::new(MemoryStore::new()))
      .unwrap()
      .with_clock(Arc::new(clock.clone()))
      .with_retry_policy(retry),
  )
}

#[test]
fn enqueue_claim_and_mark_synced() {
  let dir = TempDir::new().unwrap();
  let store = Arc::new(SqliteStore::open(&dir.path().join("sync.db")).unwrap());
  let queue = SyncQueue::new(store).unwrap();

  let item = queue
    .enqueue("note", "1", Operation::Create, Some(json!({"title": "a"})))
    .unwrap();

  let claimed = queue.dequeue_pending(1).unwrap();
  assert_eq!(claimed.len(), 1);
  assert_eq!(claimed[0].id, item.id);
  assert_eq!(claimed[0].status, SyncStatus::Syncing);

  queue.mark_synced(&item.id).unwrap();

  let synced: Vec<_> = queue
    .list_by_status(SyncStatus::Synced)
    .collect::<Result<_, _>>()
    .unwrap();
  assert_eq!(synced.len(), 1);
  assert_eq!(synced[0].id, item.id);
  assert_eq!(synced[0].payload, Some(json!({"title": "a"})));
}

#[test]
fn pending_updates_coalesce_to_latest_payload() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, RetryPolicy::default());

  queue
    .enqueue("note", "1", Operation::Update, Some(json!({"v": "x"})))
    .unwrap();
  queue
    .enqueue("note", "1", Operation::Update, Some(json!({"v": "y"})))
    .unwrap();

  let pending: Vec<_> = queue
    .list_by_status(SyncStatus::Pending)
    .collect::<Result<_, _>>()
    .unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].payload, Some(json!({"v": "y"})));
}

#[test]
fn queue_reopens_with_items_intact() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("sync.db");

  let first = {
    let queue = SyncQueue::new(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
    queue
      .enqueue("note", "1", Operation::Create, Some(json!({"t": 1})))
      .unwrap()
  };

  let queue = SyncQueue::new(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
  let reopened = queue.get(&first.id).unwrap().unwrap();
  assert_eq!(reopened.status, SyncStatus::Pending);
  assert_eq!(reopened.payload, Some(json!({"t": 1})));

  // Ids keep increasing across restarts
  let second = queue
    .enqueue("note", "2", Operation::Create, None)
    .unwrap();
  assert!(second.id > first.id);
}

#[tokio::test]
async fn concurrent_triggers_create_one_session() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, RetryPolicy::default());
  queue.enqueue("note", "1", Operation::Create, None).unwrap();

  let remote = Arc::new(ScriptedRemote::slow(Duration::from_millis(50)));
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), remote);
  let cancel = Cancellation::new();

  let (a, b) = tokio::join!(coordinator.run_once(&cancel), coordinator.run_once(&cancel));
  let outcomes = [a.unwrap(), b.unwrap()];

  let completed = outcomes
    .iter()
    .filter(|o| matches!(o, RunOutcome::Completed(_)))
    .count();
  let skipped = outcomes
    .iter()
    .filter(|o| matches!(o, RunOutcome::AlreadyRunning))
    .count();
  assert_eq!((completed, skipped), (1, 1));
  assert_eq!(coordinator.sessions().len(), 1);
  assert_eq!(queue.counts().unwrap().synced, 1);
}

#[tokio::test]
async fn conflict_keeps_local_payload_until_resolved() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, RetryPolicy::default());
  let item = queue
    .enqueue("note", "1", Operation::Update, Some(json!({"v": "local"})))
    .unwrap();

  let remote = Arc::new(ScriptedRemote::default());
  remote.reply("1", ApplyResult::Conflict(Some(json!({"v": "remote"}))));
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), Arc::clone(&remote));

  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.conflict, 1);

  let conflicted = queue.get(&item.id).unwrap().unwrap();
  assert_eq!(conflicted.status, SyncStatus::Conflict);
  assert_eq!(conflicted.payload, Some(json!({"v": "local"})));
  assert_eq!(conflicted.conflict_payload, Some(json!({"v": "remote"})));

  // Conflicts are not retried automatically
  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.attempted(), 0);

  let resolution = coordinator.resolve_conflict(&item.id, true).unwrap();
  assert_eq!(
    resolution,
    Resolution::Requeued {
      id: item.id.clone()
    }
  );

  remote.reply("1", ApplyResult::Applied(None));
  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.synced, 1);

  let calls = remote.calls();
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[1].2, Some(json!({"v": "local"})));
}

#[tokio::test]
async fn adopting_remote_returns_snapshot() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, RetryPolicy::default());
  let item = queue
    .enqueue("note", "1", Operation::Update, Some(json!({"v": "local"})))
    .unwrap();

  let remote = Arc::new(ScriptedRemote::default());
  remote.reply("1", ApplyResult::Conflict(Some(json!({"v": "remote"}))));
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), remote);
  coordinator.run_once(&Cancellation::new()).await.unwrap();

  let resolution = coordinator.resolve_conflict(&item.id, false).unwrap();
  assert_eq!(
    resolution,
    Resolution::AdoptedRemote {
      snapshot: Some(json!({"v": "remote"}))
    }
  );
  assert_eq!(queue.get(&item.id).unwrap().unwrap().status, SyncStatus::Synced);
}

#[tokio::test]
async fn failures_back_off_then_exhaust() {
  let clock = ManualClock::default();
  let queue = memory_queue(
    &clock,
    RetryPolicy {
      max_retries: 1,
      initial: Duration::from_secs(10),
      max: Duration::from_secs(10),
      factor: 1.0,
    },
  );
  let item = queue.enqueue("note", "1", Operation::Update, None).unwrap();

  let remote = Arc::new(ScriptedRemote::default());
  remote.reply("1", ApplyResult::Failure("503".to_string()));
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), Arc::clone(&remote));

  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.retrying, 1);

  // Still backing off
  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.attempted(), 0);

  clock.advance(chrono::Duration::seconds(11));
  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.failed, 1);

  let failed = queue.get(&item.id).unwrap().unwrap();
  assert_eq!(failed.status, SyncStatus::Failed);
  assert_eq!(failed.retry_count, 2);
  assert_eq!(remote.calls().len(), 2);

  // Manual retry starts a fresh budget
  let retried = queue.retry_failed(&item.id).unwrap();
  assert_eq!(retried.status, SyncStatus::Pending);
  assert_eq!(retried.retry_count, 0);
}

#[tokio::test]
async fn parallel_workers_are_bounded() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, RetryPolicy::default());
  for i in 0..6 {
    queue
      .enqueue("note", &i.to_string(), Operation::Create, None)
      .unwrap();
  }

  let remote = Arc::new(ScriptedRemote::slow(Duration::from_millis(20)));
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), Arc::clone(&remote)).with_options(
    CoordinatorOptions {
      workers: 2,
      ..CoordinatorOptions::default()
    },
  );

  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  let session = outcome.session().unwrap();
  assert_eq!(session.summary.synced, 6);
  assert_eq!(session.item_ids_processed.len(), 6);
  assert_eq!(remote.peak_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sequential_run_preserves_local_order() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, RetryPolicy::default());
  for id in ["a", "b", "c"] {
    queue.enqueue("note", id, Operation::Create, None).unwrap();
    clock.advance(chrono::Duration::seconds(1));
  }

  let remote = Arc::new(ScriptedRemote::default());
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), Arc::clone(&remote));
  coordinator.run_once(&Cancellation::new()).await.unwrap();

  let order: Vec<String> = remote.calls().into_iter().map(|(id, _, _)| id).collect();
  assert_eq!(order, vec!["a", "b", "c"]);
}

/// Records a newer local edit while the first one is in flight.
struct EditDuringApply {
  queue: Arc<SyncQueue<MemoryStore>>,
}

#[async_trait]
impl RemoteService for EditDuringApply {
  async fn apply(
    &self,
    entity_type: &str,
    entity_id: &str,
    _operation: Operation,
    payload: Option<&Value>,
    _timeout: Duration,
  ) -> ApplyResult {
    if payload == Some(&json!({"v": 1})) {
      self
        .queue
        .enqueue(entity_type, entity_id, Operation::Update, Some(json!({"v": 2})))
        .unwrap();
    }
    ApplyResult::Applied(None)
  }
}

#[tokio::test]
async fn edit_during_flight_is_not_lost() {
  let clock = ManualClock::default();
  let queue = memory_queue(&clock, no_backoff(3));
  queue
    .enqueue("note", "1", Operation::Update, Some(json!({"v": 1})))
    .unwrap();

  let remote = Arc::new(EditDuringApply {
    queue: Arc::clone(&queue),
  });
  let coordinator = SyncCoordinator::new(Arc::clone(&queue), remote);

  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.superseded, 1);

  let newer = queue.outstanding_for("note", "1").unwrap().unwrap();
  assert_eq!(newer.status, SyncStatus::Pending);
  assert_eq!(newer.payload, Some(json!({"v": 2})));

  let outcome = coordinator.run_once(&Cancellation::new()).await.unwrap();
  assert_eq!(outcome.session().unwrap().summary.synced, 1);
  assert_eq!(queue.counts().unwrap().synced, 1);
}
