use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flowdeck_flow::{ChangeNotification, ChangeType, FlowContent, FlowDocument, FlowPatch};
use tokio::sync::broadcast;

use crate::{FlowStore, StoreError};

/// A failure to inject into the next save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailure {
  /// Reject the save as if another writer got there first.
  Conflict,
  /// Fail the save as if the server were unreachable.
  Unavailable,
}

/// A recorded save call.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveCall {
  pub flow_id: String,
  pub content: FlowContent,
  pub expected_version: u64,
}

#[derive(Default)]
struct Inner {
  flows: HashMap<String, FlowDocument>,
  failures: VecDeque<StoreFailure>,
  saves: Vec<SaveCall>,
  fetches: Vec<String>,
  latency: Option<Duration>,
}

/// In-process flow store.
///
/// Behaves like the remote store: versions are assigned on every accepted
/// write and a change notification is broadcast for each one, including
/// writes made by the subscriber itself. Failures can be scripted per save.
pub struct MemoryFlowStore {
  inner: Mutex<Inner>,
  changes: broadcast::Sender<ChangeNotification>,
}

impl Default for MemoryFlowStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryFlowStore {
  pub fn new() -> Self {
    let (changes, _) = broadcast::channel(64);
    Self {
      inner: Mutex::new(Inner::default()),
      changes,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    // A panicking test thread must not wedge the others.
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Store a document as-is (version 0 is bumped to 1) and return it.
  pub fn insert(&self, mut document: FlowDocument) -> FlowDocument {
    if document.version == 0 {
      document.version = 1;
    }
    let now = Utc::now();
    document.created_at = now;
    document.updated_at = now;
    self
      .lock()
      .flows
      .insert(document.id.clone(), document.clone());
    document
  }

  /// Simulate a write from another client: applies `patch`, bumps the
  /// version and broadcasts a change notification.
  pub fn write_external(
    &self,
    flow_id: &str,
    patch: FlowPatch,
  ) -> Result<FlowDocument, StoreError> {
    let stored = {
      let mut inner = self.lock();
      let current = inner
        .flows
        .get(flow_id)
        .ok_or_else(|| StoreError::NotFound(flow_id.to_string()))?;
      let mut next = current.merged(FlowPatch {
        version: None,
        ..patch
      });
      next.version = current.version + 1;
      next.updated_at = Utc::now();
      inner.flows.insert(flow_id.to_string(), next.clone());
      next
    };
    self.notify(ChangeType::Updated, flow_id);
    Ok(stored)
  }

  /// Remove a flow and broadcast its deletion.
  pub fn delete(&self, flow_id: &str) -> Option<FlowDocument> {
    let removed = self.lock().flows.remove(flow_id);
    if removed.is_some() {
      self.notify(ChangeType::Deleted, flow_id);
    }
    removed
  }

  /// Make the next save fail with the given failure.
  pub fn fail_next_save(&self, failure: StoreFailure) {
    self.lock().failures.push_back(failure);
  }

  /// Delay every fetch and save by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    self.lock().latency = Some(latency);
  }

  /// Current stored copy of a flow.
  pub fn get(&self, flow_id: &str) -> Option<FlowDocument> {
    self.lock().flows.get(flow_id).cloned()
  }

  /// Every save call received so far, in order.
  pub fn saves(&self) -> Vec<SaveCall> {
    self.lock().saves.clone()
  }

  /// Number of fetch calls received so far.
  pub fn fetch_count(&self) -> usize {
    self.lock().fetches.len()
  }

  /// Subscribe to change notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
    self.changes.subscribe()
  }

  /// Sender side of the change notifications, for feeds that wrap it.
  pub fn changes(&self) -> broadcast::Sender<ChangeNotification> {
    self.changes.clone()
  }

  fn notify(&self, change_type: ChangeType, flow_id: &str) {
    // No subscribers is fine
    let _ = self
      .changes
      .send(ChangeNotification::flow(change_type, flow_id));
  }

  async fn simulate_latency(&self) {
    let latency = self.lock().latency;
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }
  }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
  async fn fetch(&self, flow_id: &str) -> Result<FlowDocument, StoreError> {
    self.lock().fetches.push(flow_id.to_string());
    self.simulate_latency().await;

    self
      .lock()
      .flows
      .get(flow_id)
      .cloned()
      .ok_or_else(|| StoreError::NotFound(flow_id.to_string()))
  }

  async fn save(
    &self,
    flow_id: &str,
    content: &FlowContent,
    expected_version: u64,
  ) -> Result<FlowDocument, StoreError> {
    self.lock().saves.push(SaveCall {
      flow_id: flow_id.to_string(),
      content: content.clone(),
      expected_version,
    });
    self.simulate_latency().await;

    let stored = {
      let mut inner = self.lock();
      let failure = inner.failures.pop_front();
      let current = inner
        .flows
        .get(flow_id)
        .ok_or_else(|| StoreError::NotFound(flow_id.to_string()))?;

      match failure {
        Some(StoreFailure::Unavailable) => {
          return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Some(StoreFailure::Conflict) => {
          return Err(StoreError::VersionConflict {
            flow_id: flow_id.to_string(),
            expected: expected_version,
            actual: Some(current.version),
          });
        }
        None if current.version != expected_version => {
          return Err(StoreError::VersionConflict {
            flow_id: flow_id.to_string(),
            expected: expected_version,
            actual: Some(current.version),
          });
        }
        None => {}
      }

      let mut next = current.merged(FlowPatch::from(content.clone()));
      next.version = current.version + 1;
      next.updated_at = Utc::now();
      inner.flows.insert(flow_id.to_string(), next.clone());
      next
    };

    self.notify(ChangeType::Updated, flow_id);
    Ok(stored)
  }
}
