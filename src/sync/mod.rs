//! Offline mutation queue and reconciliation with a remote store.
//!
//! - `SyncQueue` durably records local mutations, one outstanding item per entity
//! - `SyncCoordinator` drains the queue against a `RemoteService`, one run at a time
//! - Conflicts reported by the remote are kept until `resolve_conflict` is called

mod coordinator;
mod http;
mod item;
mod queue;
mod remote;
mod retry;
mod session;

pub use coordinator::{CoordinatorOptions, CoordinatorState, SyncCoordinator};
pub use http::{classify, HttpRemote};
pub use item::{Operation, SyncItem, SyncStatus};
pub use queue::{QueueCounts, Resolution, SyncQueue};
pub use remote::{ApplyResult, RemoteService};
pub use retry::RetryPolicy;
pub use session::{RunOutcome, SessionSummary, SyncSession};
