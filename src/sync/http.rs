//! JSON-over-HTTP remote.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

use super::item::Operation;
use super::remote::{ApplyResult, RemoteService};

/// Remote that maps mutations onto REST calls:
///
/// | operation | request                       |
/// |-----------|-------------------------------|
/// | Create    | `POST {base}/{type}`          |
/// | Update    | `PUT {base}/{type}/{id}`      |
/// | Delete    | `DELETE {base}/{type}/{id}`   |
///
/// 2xx is applied, 409 and 412 are conflicts (the body is the remote
/// snapshot), anything else is a failure.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote URL '{}': {}", base_url, e))?;
    // Url::join replaces the last segment unless the path ends with '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("offcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  /// Method and URL for a mutation.
  pub fn request_target(
    &self,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
  ) -> Result<(Method, Url)> {
    let mut url = self.base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| eyre!("Remote URL cannot be a base: {}", self.base))?;
      segments.pop_if_empty().push(entity_type);
      if operation != Operation::Create {
        segments.push(entity_id);
      }
    }

    let method = match operation {
      Operation::Create => Method::POST,
      Operation::Update => Method::PUT,
      Operation::Delete => Method::DELETE,
    };
    Ok((method, url))
  }

  async fn send(
    &self,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: Option<&serde_json::Value>,
    timeout: Duration,
  ) -> Result<(StatusCode, String)> {
    let (method, url) = self.request_target(entity_type, entity_id, operation)?;

    let mut request = self.client.request(method, url).timeout(timeout);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if operation == Operation::Create {
      // Creates carry the local id so the remote can deduplicate retries
      request = request.header("X-Entity-Id", entity_id);
    }
    if let Some(payload) = payload {
      request = request.json(payload);
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok((status, body))
  }
}

/// Map an HTTP response to an apply result. A delete of an entity the
/// remote does not know counts as applied.
pub fn classify(operation: Operation, status: StatusCode, body: &str) -> ApplyResult {
  let snapshot = || {
    if body.trim().is_empty() {
      None
    } else {
      Some(
        serde_json::from_str(body)
          .unwrap_or_else(|_| serde_json::Value::String(body.to_string())),
      )
    }
  };

  let already_gone = status == StatusCode::NOT_FOUND || status == StatusCode::GONE;
  if status.is_success() {
    ApplyResult::Applied(snapshot())
  } else if operation == Operation::Delete && already_gone {
    ApplyResult::Applied(None)
  } else if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
    ApplyResult::Conflict(snapshot())
  } else {
    ApplyResult::Failure(format!("remote returned {}", status))
  }
}

#[async_trait]
impl RemoteService for HttpRemote {
  async fn apply(
    &self,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: Option<&serde_json::Value>,
    timeout: Duration,
  ) -> ApplyResult {
    match self
      .send(entity_type, entity_id, operation, payload, timeout)
      .await
    {
      Ok((status, body)) => classify(operation, status, &body),
      Err(e) => ApplyResult::Failure(e.to_string()),
    }
  }
}
