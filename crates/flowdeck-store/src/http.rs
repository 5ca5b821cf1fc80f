use async_trait::async_trait;
use flowdeck_flow::{FlowContent, FlowDocument};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{FlowStore, StoreError};

/// Body of a save request: the content fields plus the version the client
/// believes the server holds.
#[derive(Debug, Serialize)]
struct SaveBody<'a> {
  #[serde(flatten)]
  content: &'a FlowContent,
  version: u64,
}

/// Body returned alongside a 409.
#[derive(Debug, Default, Deserialize)]
struct ConflictBody {
  #[serde(default)]
  current_version: Option<u64>,
}

/// HTTP-backed flow store.
///
/// Endpoints:
/// ```text
/// GET {base}/api/flows/{id}   -> FlowDocument
/// PUT {base}/api/flows/{id}   -> FlowDocument (409 on stale version)
/// ```
pub struct HttpFlowStore {
  client: Client,
  base_url: String,
}

impl HttpFlowStore {
  /// Create a store for the given API base URL (e.g. `http://localhost:8081`).
  pub fn new(client: Client, base_url: impl Into<String>) -> Self {
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Self { client, base_url }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn flow_url(&self, flow_id: &str) -> String {
    format!("{}/api/flows/{}", self.base_url, flow_id)
  }
}

#[async_trait]
impl FlowStore for HttpFlowStore {
  async fn fetch(&self, flow_id: &str) -> Result<FlowDocument, StoreError> {
    debug!(flow_id = %flow_id, "fetching flow");
    let response = self.client.get(self.flow_url(flow_id)).send().await?;

    if response.status() == StatusCode::NOT_FOUND {
      return Err(StoreError::NotFound(flow_id.to_string()));
    }

    let response = ensure_success(response).await?;
    Ok(response.json().await?)
  }

  async fn save(
    &self,
    flow_id: &str,
    content: &FlowContent,
    expected_version: u64,
  ) -> Result<FlowDocument, StoreError> {
    debug!(flow_id = %flow_id, expected_version, "saving flow");
    let body = SaveBody {
      content,
      version: expected_version,
    };
    let response = self
      .client
      .put(self.flow_url(flow_id))
      .json(&body)
      .send()
      .await?;

    match response.status() {
      StatusCode::NOT_FOUND => Err(StoreError::NotFound(flow_id.to_string())),
      StatusCode::CONFLICT => {
        let text = response.text().await.unwrap_or_default();
        let conflict: ConflictBody = serde_json::from_str(&text).unwrap_or_default();
        Err(StoreError::VersionConflict {
          flow_id: flow_id.to_string(),
          expected: expected_version,
          actual: conflict.current_version,
        })
      }
      _ => {
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
      }
    }
  }
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  Err(StoreError::Status {
    status: status.as_u16(),
    body,
  })
}
