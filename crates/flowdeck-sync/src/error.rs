//! Session error types.

use flowdeck_store::StoreError;

/// Errors surfaced to callers of a [`crate::SessionHandle`].
///
/// Failures inside the session itself (saves, refetches) are logged and
/// reported as [`crate::SessionEvent`]s instead; they never reach here.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  /// The session task has stopped.
  #[error("flow session closed")]
  SessionClosed,

  /// A later open request replaced this one before it completed.
  #[error("open of flow '{0}' superseded by a later request")]
  Superseded(String),

  /// The store failed while serving the request.
  #[error("store error: {0}")]
  Store(#[from] StoreError),
}
