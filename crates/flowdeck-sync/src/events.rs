//! Session events and notifiers for observability.
//!
//! Events are emitted by the session task as saves and refetches complete,
//! so consumers can report progress, drive a status line, or assert on
//! persistence in tests.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by a flow session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
  /// A flow was fetched and installed as the canonical document.
  FlowOpened { flow_id: String, version: u64 },

  /// The debounced save fired.
  SaveStarted {
    flow_id: String,
    expected_version: u64,
  },

  /// The store accepted the save.
  Saved { flow_id: String, version: u64 },

  /// The save failed with something other than a version conflict.
  SaveFailed { flow_id: String, error: String },

  /// The store rejected the save as stale; a refetch is under way.
  ConflictDetected {
    flow_id: String,
    expected_version: u64,
  },

  /// The refetched copy was dispatched after a conflict.
  Rebased {
    flow_id: String,
    version: u64,
    /// Whether the refetched content differed from the local document.
    changed: bool,
  },

  /// The refetch after a conflict failed.
  RefetchFailed { flow_id: String, error: String },

  /// A copy delivered by the change feed was not applied.
  FetchIgnored {
    flow_id: String,
    version: u64,
    reason: String,
  },
}

impl SessionEvent {
  pub fn flow_id(&self) -> &str {
    match self {
      SessionEvent::FlowOpened { flow_id, .. }
      | SessionEvent::SaveStarted { flow_id, .. }
      | SessionEvent::Saved { flow_id, .. }
      | SessionEvent::SaveFailed { flow_id, .. }
      | SessionEvent::ConflictDetected { flow_id, .. }
      | SessionEvent::Rebased { flow_id, .. }
      | SessionEvent::RefetchFailed { flow_id, .. }
      | SessionEvent::FetchIgnored { flow_id, .. } => flow_id,
    }
  }
}

/// Trait for receiving session events.
///
/// The session calls `notify` from its own task; implementations must not
/// block.
pub trait SessionNotifier: Send + Sync {
  fn notify(&self, event: SessionEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl SessionNotifier for NoopNotifier {
  fn notify(&self, _event: SessionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls the session; volume is at most
  // a few events per save.
  sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with the receiving end.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl SessionNotifier for ChannelNotifier {
  fn notify(&self, event: SessionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
