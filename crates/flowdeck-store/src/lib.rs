//! Flowdeck Store
//!
//! This crate provides the persistence trait for flow documents and its
//! implementations. The remote store is the authority on versions: every
//! successful save returns the document as stored, carrying the version the
//! server assigned.
//!
//! The [`FlowStore`] trait defines two operations:
//! - `fetch` an authoritative copy of a document
//! - `save` new content under optimistic concurrency (`expected_version`)
//!
//! Implementations:
//! - [`HttpFlowStore`] talks to the flow API over HTTP
//! - [`MemoryFlowStore`] keeps documents in process and broadcasts change
//!   notifications, standing in for the server in tests and demos

mod http;
mod memory;

pub use http::HttpFlowStore;
pub use memory::{MemoryFlowStore, SaveCall, StoreFailure};

use async_trait::async_trait;
use flowdeck_flow::{FlowContent, FlowDocument};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested flow was not found.
  #[error("flow not found: {0}")]
  NotFound(String),

  /// The save was rejected because the stored version moved on.
  #[error("version conflict on flow {flow_id}: expected version {expected}")]
  VersionConflict {
    flow_id: String,
    expected: u64,
    actual: Option<u64>,
  },

  /// The request could not be completed.
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  /// The server answered with an unexpected status.
  #[error("unexpected status {status}: {body}")]
  Status { status: u16, body: String },

  /// The store is unreachable.
  #[error("store unavailable: {0}")]
  Unavailable(String),
}

/// Storage trait for flow documents.
#[async_trait]
pub trait FlowStore: Send + Sync {
  /// Fetch the authoritative copy of a flow.
  async fn fetch(&self, flow_id: &str) -> Result<FlowDocument, StoreError>;

  /// Save new content for a flow.
  ///
  /// Fails with [`StoreError::VersionConflict`] when `expected_version` is no
  /// longer the stored version.
  async fn save(
    &self,
    flow_id: &str,
    content: &FlowContent,
    expected_version: u64,
  ) -> Result<FlowDocument, StoreError>;
}
