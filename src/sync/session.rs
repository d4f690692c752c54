//! Reconciliation run reports.

use chrono::{DateTime, Utc};

use super::item::SyncStatus;

/// Per-run tally of what happened to each claimed item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
  pub synced: usize,
  pub conflict: usize,
  /// Failed, back in `Pending` awaiting retry
  pub retrying: usize,
  /// Failed with retries exhausted
  pub failed: usize,
  /// Claimed but not attempted because the run was cancelled
  pub skipped: usize,
  /// Replaced by a newer local mutation while in flight
  pub superseded: usize,
  /// Result could not be recorded (storage error)
  pub errors: usize,
}

impl SessionSummary {
  pub(crate) fn record(&mut self, status: SyncStatus) {
    match status {
      SyncStatus::Synced => self.synced += 1,
      SyncStatus::Conflict => self.conflict += 1,
      SyncStatus::Pending => self.retrying += 1,
      SyncStatus::Failed => self.failed += 1,
      // A claim only leaves Syncing through the transitions above
      SyncStatus::Syncing => self.errors += 1,
    }
  }

  pub fn attempted(&self) -> usize {
    self.synced + self.conflict + self.retrying + self.failed + self.superseded + self.errors
  }
}

/// One reconciliation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
  pub id: u64,
  pub started_at: DateTime<Utc>,
  pub ended_at: Option<DateTime<Utc>>,
  pub item_ids_processed: Vec<String>,
  pub summary: SessionSummary,
  pub cancelled: bool,
}

impl SyncSession {
  pub(crate) fn open(id: u64, started_at: DateTime<Utc>) -> Self {
    Self {
      id,
      started_at,
      ended_at: None,
      item_ids_processed: Vec::new(),
      summary: SessionSummary::default(),
      cancelled: false,
    }
  }

  pub(crate) fn close(&mut self, ended_at: DateTime<Utc>, cancelled: bool) {
    self.ended_at = Some(ended_at);
    self.cancelled = cancelled;
  }
}

/// What a call to `run_once` did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
  Completed(SyncSession),
  /// Another run was in flight; nothing was done
  AlreadyRunning,
  /// Stopped between items; unattempted claims stay `Syncing`
  Cancelled(SyncSession),
}

impl RunOutcome {
  pub fn session(&self) -> Option<&SyncSession> {
    match self {
      Self::Completed(s) | Self::Cancelled(s) => Some(s),
      Self::AlreadyRunning => None,
    }
  }
}
