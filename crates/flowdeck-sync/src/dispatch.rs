//! The dispatch core: owner of the canonical document.
//!
//! Every update from every surface goes through [`DispatchCore::dispatch`],
//! which decides whether the update is meaningful. Only meaningful updates
//! replace the document and advance the signal counter; updates that differ
//! from the current document only in version metadata are absorbed silently.
//! That silent path is what stops a save round-trip or a push notification
//! about our own write from echoing back as a visible change.
//!
//! The core is synchronous and owns no timers. Scheduling the debounced save
//! and running network calls is the job of [`crate::FlowSession`], which asks
//! the core for a [`SaveRequest`] when its timer fires.

use std::sync::Arc;

use flowdeck_flow::{FlowContent, FlowDocument, FlowPatch};
use tokio::sync::watch;
use tracing::debug;

use crate::signal::{Snapshot, UpdateSignal, UpdateSource};

/// Result of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
  /// No flow is active; the update was dropped.
  NoActiveDocument,
  /// The update carried nothing new.
  Unchanged,
  /// Content was unchanged but the server reported a different version,
  /// which was adopted without a signal.
  VersionAdopted(u64),
  /// Content changed and a new signal was published.
  Applied {
    signal: UpdateSignal,
    /// Whether the change must be written back to the store.
    persist: bool,
  },
}

/// Everything needed to persist the active flow, read at fire time.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
  pub flow_id: String,
  pub content: FlowContent,
  pub expected_version: u64,
}

/// Owns the canonical document, the signal counter and the version reference.
pub struct DispatchCore {
  document: Option<Arc<FlowDocument>>,
  counter: u64,
  source: UpdateSource,
  version: Option<u64>,
  publisher: watch::Sender<Snapshot>,
}

impl Default for DispatchCore {
  fn default() -> Self {
    Self::new()
  }
}

impl DispatchCore {
  pub fn new() -> Self {
    let (publisher, _) = watch::channel(Snapshot::empty());
    Self {
      document: None,
      counter: 0,
      source: UpdateSource::Init,
      version: None,
      publisher,
    }
  }

  /// Subscribe to published snapshots.
  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.publisher.subscribe()
  }

  pub fn document(&self) -> Option<&FlowDocument> {
    self.document.as_deref()
  }

  pub fn flow_id(&self) -> Option<&str> {
    self.document.as_ref().map(|d| d.id.as_str())
  }

  /// The last published signal.
  pub fn signal(&self) -> UpdateSignal {
    UpdateSignal {
      counter: self.counter,
      source: self.source,
    }
  }

  /// The version this core believes the store holds for the active flow.
  pub fn version(&self) -> Option<u64> {
    self.version
  }

  /// Replace the canonical document wholesale.
  ///
  /// Always publishes a new `init` signal, even when the content is identical
  /// to what was there before: consumers re-seed from scratch on init.
  pub fn init_flow(&mut self, document: FlowDocument) -> UpdateSignal {
    self.version = Some(document.version);
    self.document = Some(Arc::new(document));
    self.publish(UpdateSource::Init)
  }

  /// Drop the active flow. Later dispatches are no-ops until the next init.
  pub fn close(&mut self) {
    self.document = None;
    self.version = None;
    let signal = self.signal();
    self.publisher.send_replace(Snapshot {
      flow_id: None,
      document: None,
      signal,
    });
  }

  /// Merge a partial update into the canonical document.
  pub fn dispatch(&mut self, source: UpdateSource, patch: FlowPatch) -> DispatchOutcome {
    let Some(current) = self.document.clone() else {
      return DispatchOutcome::NoActiveDocument;
    };

    let reported_version = patch.version;
    let next = current.merged(patch);

    if current.same_content(&next) {
      return match reported_version {
        Some(version) if version != current.version => {
          debug!(
            flow_id = %current.id,
            source = %source,
            version,
            "content unchanged, adopting reported version"
          );
          self.adopt_silently(version);
          DispatchOutcome::VersionAdopted(version)
        }
        _ => DispatchOutcome::Unchanged,
      };
    }

    if let Some(version) = reported_version {
      self.version = Some(version);
    }
    self.document = Some(Arc::new(next));
    let signal = self.publish(source);

    DispatchOutcome::Applied {
      signal,
      persist: source.persists(),
    }
  }

  /// Adopt a version confirmed by the store without publishing a signal.
  ///
  /// Versions older than the current reference are ignored. Returns whether
  /// the version was adopted.
  pub fn adopt_version(&mut self, version: u64) -> bool {
    if self.document.is_none() || self.version.is_some_and(|known| version <= known) {
      return false;
    }
    self.adopt_silently(version);
    true
  }

  /// Build a save request from the current state, or `None` if no flow is
  /// active.
  pub fn save_request(&self) -> Option<SaveRequest> {
    let document = self.document.as_ref()?;
    Some(SaveRequest {
      flow_id: document.id.clone(),
      content: document.content(),
      expected_version: self.version.unwrap_or(document.version),
    })
  }

  fn adopt_silently(&mut self, version: u64) {
    self.version = Some(version);
    let Some(current) = self.document.as_ref() else {
      return;
    };

    let mut updated = (**current).clone();
    updated.version = version;
    let updated = Arc::new(updated);
    self.document = Some(updated.clone());

    // Update the observed document without waking anyone.
    self.publisher.send_if_modified(|snapshot| {
      if snapshot.flow_id.as_deref() == Some(updated.id.as_str()) {
        snapshot.document = Some(updated.clone());
      }
      false
    });
  }

  fn publish(&mut self, source: UpdateSource) -> UpdateSignal {
    self.counter += 1;
    self.source = source;
    let signal = self.signal();
    self.publisher.send_replace(Snapshot {
      flow_id: self.document.as_ref().map(|d| d.id.clone()),
      document: self.document.clone(),
      signal,
    });
    signal
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowdeck_flow::{FlowEdge, FlowNode, NodeType};

  fn node(id: &str) -> FlowNode {
    FlowNode::new(id, NodeType::Executor, "claude")
  }

  fn test_document(version: u64) -> FlowDocument {
    let mut doc = FlowDocument::new("flow-1", "Digest");
    doc.nodes = vec![FlowNode::new("t1", NodeType::Trigger, "cron")];
    doc.version = version;
    doc
  }

  #[test]
  fn test_dispatch_without_document_is_noop() {
    let mut core = DispatchCore::new();
    let outcome = core.dispatch(UpdateSource::Canvas, FlowPatch::default().with_name("x"));
    assert_eq!(outcome, DispatchOutcome::NoActiveDocument);
    assert_eq!(core.signal().counter, 0);
  }

  #[test]
  fn test_init_always_bumps_counter() {
    let mut core = DispatchCore::new();
    let first = core.init_flow(test_document(1));
    let second = core.init_flow(test_document(1));

    assert_eq!(first.counter, 1);
    assert_eq!(second.counter, 2);
    assert_eq!(second.source, UpdateSource::Init);
    assert_eq!(core.version(), Some(1));
  }

  #[test]
  fn test_meaningful_change_bumps_counter() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(1));

    let outcome = core.dispatch(
      UpdateSource::Canvas,
      FlowPatch::default().with_nodes(vec![node("a"), node("b")]),
    );

    assert_eq!(
      outcome,
      DispatchOutcome::Applied {
        signal: UpdateSignal {
          counter: 2,
          source: UpdateSource::Canvas,
        },
        persist: true,
      }
    );
    assert_eq!(core.document().unwrap().nodes.len(), 2);
  }

  #[test]
  fn test_n_distinct_dispatches_bump_counter_n_times() {
    let mut core = DispatchCore::new();
    let start = core.init_flow(test_document(1)).counter;

    for i in 0..5 {
      core.dispatch(
        UpdateSource::Editor,
        FlowPatch::default().with_name(format!("name {i}")),
      );
    }

    assert_eq!(core.signal().counter, start + 5);
  }

  #[test]
  fn test_identical_content_is_unchanged() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(1));
    let before = core.signal();

    let patch = FlowPatch::from_document(test_document(1));
    assert_eq!(
      core.dispatch(UpdateSource::Canvas, patch),
      DispatchOutcome::Unchanged
    );
    assert_eq!(core.signal(), before);
  }

  #[test]
  fn test_server_echo_adopts_version_silently() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(1));
    let mut receiver = core.subscribe();
    receiver.borrow_and_update();

    let outcome = core.dispatch(
      UpdateSource::Server,
      FlowPatch::from_document(test_document(5)),
    );

    assert_eq!(outcome, DispatchOutcome::VersionAdopted(5));
    assert_eq!(core.signal().counter, 1);
    assert_eq!(core.version(), Some(5));
    assert_eq!(core.document().unwrap().version, 5);
    // Observers see the new version without being woken
    assert!(!receiver.has_changed().unwrap());
    assert_eq!(receiver.borrow().document().unwrap().version, 5);
  }

  #[test]
  fn test_version_only_patch_is_silent() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(1));

    let outcome = core.dispatch(UpdateSource::Server, FlowPatch::default().with_version(3));
    assert_eq!(outcome, DispatchOutcome::VersionAdopted(3));
    assert_eq!(core.signal().counter, 1);
    assert_eq!(core.save_request().unwrap().expected_version, 3);
  }

  #[test]
  fn test_server_change_does_not_persist() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(1));

    let mut server_copy = test_document(2);
    server_copy.edges = vec![FlowEdge::between("t1", "t1")];
    let outcome = core.dispatch(UpdateSource::Server, FlowPatch::from_document(server_copy));

    assert!(matches!(
      outcome,
      DispatchOutcome::Applied {
        persist: false,
        signal,
      } if signal.source == UpdateSource::Server
    ));
    assert_eq!(core.version(), Some(2));
  }

  #[test]
  fn test_adopt_version_is_monotonic() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(3));

    assert!(!core.adopt_version(2));
    assert!(!core.adopt_version(3));
    assert!(core.adopt_version(4));
    assert_eq!(core.version(), Some(4));
    assert_eq!(core.signal().counter, 1);
  }

  #[test]
  fn test_save_request_reads_current_state() {
    let mut core = DispatchCore::new();
    assert!(core.save_request().is_none());

    core.init_flow(test_document(2));
    core.dispatch(UpdateSource::Canvas, FlowPatch::default().with_name("first"));
    core.dispatch(UpdateSource::Canvas, FlowPatch::default().with_name("second"));

    let request = core.save_request().unwrap();
    assert_eq!(request.flow_id, "flow-1");
    assert_eq!(request.content.name, "second");
    assert_eq!(request.expected_version, 2);
  }

  #[test]
  fn test_close_clears_document() {
    let mut core = DispatchCore::new();
    core.init_flow(test_document(1));
    let receiver = core.subscribe();
    core.close();

    assert!(core.document().is_none());
    assert!(receiver.borrow().flow_id.is_none());
    assert_eq!(
      core.dispatch(UpdateSource::Editor, FlowPatch::default().with_name("x")),
      DispatchOutcome::NoActiveDocument
    );
    assert_eq!(core.signal().counter, 1);
  }
}
