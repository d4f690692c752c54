//! Remote collaborator interface.

use async_trait::async_trait;
use std::time::Duration;

use super::item::Operation;

/// Outcome of applying one mutation remotely.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
  /// Accepted; carries the remote's resulting state if it returned one
  Applied(Option<serde_json::Value>),
  /// Rejected because the remote holds a conflicting edit
  Conflict(Option<serde_json::Value>),
  /// Transport or server error; the mutation may be retried
  Failure(String),
}

/// The remote store the queue reconciles against.
///
/// The remote is the arbiter of conflicts: when it holds a concurrent edit
/// it must report [`ApplyResult::Conflict`] rather than overwrite.
#[async_trait]
pub trait RemoteService: Send + Sync {
  async fn apply(
    &self,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: Option<&serde_json::Value>,
    timeout: Duration,
  ) -> ApplyResult;
}
