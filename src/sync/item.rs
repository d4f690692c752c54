//! Sync item record.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::store::{column, format_time, opt_text, parse_time, text, Record, Table};

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      _ => Err(format!("unknown operation '{}'", s)),
    }
  }
}

/// Where a sync item is in its lifecycle.
///
/// `Pending -> Syncing -> {Synced | Conflict | Failed}`, with failures
/// returning to `Pending` until retries run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
  Pending,
  Syncing,
  Synced,
  Conflict,
  Failed,
}

impl SyncStatus {
  pub const ALL: [SyncStatus; 5] = [
    Self::Pending,
    Self::Syncing,
    Self::Synced,
    Self::Conflict,
    Self::Failed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Synced => "synced",
      Self::Conflict => "conflict",
      Self::Failed => "failed",
    }
  }

  /// Pending and syncing items are outstanding: at most one per entity.
  pub fn is_outstanding(&self) -> bool {
    matches!(self, Self::Pending | Self::Syncing)
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|status| status.as_str() == s)
      .ok_or_else(|| format!("unknown sync status '{}'", s))
  }
}

/// A queued local mutation awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
  /// Time-ordered unique id
  pub id: String,
  pub entity_type: String,
  pub entity_id: String,
  pub operation: Operation,
  /// Absent for deletes
  pub payload: Option<serde_json::Value>,
  pub local_modified_at: DateTime<Utc>,
  pub status: SyncStatus,
  /// Remote snapshot captured when a conflict was reported
  pub conflict_payload: Option<serde_json::Value>,
  pub retry_count: u32,
  pub last_error: Option<String>,
  /// Earliest time a retried item may be claimed again
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub status_changed_at: DateTime<Utc>,
}

impl SyncItem {
  pub fn new(
    id: String,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: Option<serde_json::Value>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id,
      entity_type: entity_type.to_string(),
      entity_id: entity_id.to_string(),
      operation,
      payload: if operation == Operation::Delete {
        None
      } else {
        payload
      },
      local_modified_at: now,
      status: SyncStatus::Pending,
      conflict_payload: None,
      retry_count: 0,
      last_error: None,
      next_attempt_at: None,
      status_changed_at: now,
    }
  }

  /// Pending and past any retry backoff.
  pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
    self.status == SyncStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
  }

  pub(crate) fn set_status(&mut self, status: SyncStatus, now: DateTime<Utc>) {
    self.status = status;
    self.status_changed_at = now;
  }
}

fn json_column(value: &Option<serde_json::Value>) -> Value {
  opt_text(value.as_ref().map(|v| v.to_string()))
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>, String> {
  raw
    .map(|s| serde_json::from_str(&s).map_err(|e| format!("bad json payload: {}", e)))
    .transpose()
}

impl Record for SyncItem {
  const TABLE: Table = Table::SyncItems;

  fn key(&self) -> &str {
    &self.id
  }

  fn to_row(&self) -> Vec<Value> {
    vec![
      text(&self.id),
      text(&self.entity_type),
      text(&self.entity_id),
      text(self.operation.as_str()),
      json_column(&self.payload),
      Value::Text(format_time(&self.local_modified_at)),
      text(self.status.as_str()),
      json_column(&self.conflict_payload),
      Value::Integer(i64::from(self.retry_count)),
      opt_text(self.last_error.clone()),
      opt_text(self.next_attempt_at.as_ref().map(format_time)),
      Value::Text(format_time(&self.status_changed_at)),
    ]
  }

  fn from_row(row: &Row<'_>) -> Result<Self, String> {
    let retry_count: i64 = column(row, 8)?;
    Ok(Self {
      id: column(row, 0)?,
      entity_type: column(row, 1)?,
      entity_id: column(row, 2)?,
      operation: column::<String>(row, 3)?.parse()?,
      payload: parse_json(column(row, 4)?)?,
      local_modified_at: parse_time(&column::<String>(row, 5)?)?,
      status: column::<String>(row, 6)?.parse()?,
      conflict_payload: parse_json(column(row, 7)?)?,
      retry_count: u32::try_from(retry_count).map_err(|e| e.to_string())?,
      last_error: column(row, 9)?,
      next_attempt_at: column::<Option<String>>(row, 10)?
        .map(|s| parse_time(&s))
        .transpose()?,
      status_changed_at: parse_time(&column::<String>(row, 11)?)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_parse_roundtrip_names() {
    for status in SyncStatus::ALL {
      assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
    }
    assert!("bogus".parse::<SyncStatus>().is_err());
  }

  #[test]
  fn test_delete_drops_payload() {
    let item = SyncItem::new(
      "1".into(),
      "note",
      "1",
      Operation::Delete,
      Some(json!({"title": "a"})),
      Utc::now(),
    );
    assert!(item.payload.is_none());
  }

  #[test]
  fn test_ready_respects_backoff() {
    let now = Utc::now();
    let mut item = SyncItem::new("1".into(), "note", "1", Operation::Create, None, now);
    assert!(item.is_ready(now));

    item.next_attempt_at = Some(now + chrono::Duration::seconds(5));
    assert!(!item.is_ready(now));
    assert!(item.is_ready(now + chrono::Duration::seconds(5)));

    item.set_status(SyncStatus::Syncing, now);
    assert!(!item.is_ready(now + chrono::Duration::seconds(10)));
  }
}
