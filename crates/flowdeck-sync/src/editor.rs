//! The raw text editor surface.

use flowdeck_flow::{FlowDocument, FlowPatch};
use serde::Serialize;

use crate::signal::{Snapshot, UpdateSignal, UpdateSource};

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
  #[error("invalid flow json: {0}")]
  Parse(#[from] serde_json::Error),
}

/// What the editor shows: the document content plus its version.
#[derive(Serialize)]
struct EditorView<'a> {
  name: &'a str,
  description: &'a str,
  enabled: bool,
  nodes: &'a [flowdeck_flow::FlowNode],
  edges: &'a [flowdeck_flow::FlowEdge],
  version: u64,
}

impl<'a> EditorView<'a> {
  fn of(document: &'a FlowDocument) -> Self {
    Self {
      name: &document.name,
      description: &document.description,
      enabled: document.enabled,
      nodes: &document.nodes,
      edges: &document.edges,
      version: document.version,
    }
  }
}

/// Text buffer kept in step with the canonical document.
///
/// The editor is authoritative for its own text: signals it produced never
/// re-render the buffer, so the cursor and any formatting the user typed
/// survive their own edits.
#[derive(Debug, Default)]
pub struct EditorSurface {
  text: String,
  last_applied_counter: u64,
  last_flow_id: Option<String>,
}

impl EditorSurface {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn text(&self) -> &str {
    &self.text
  }

  pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> bool {
    self.apply(
      snapshot.flow_id.as_deref(),
      snapshot.document(),
      snapshot.signal,
    )
  }

  /// Re-render the buffer for a new canonical state. Returns whether the
  /// text changed.
  pub fn apply(
    &mut self,
    flow_id: Option<&str>,
    document: Option<&FlowDocument>,
    signal: UpdateSignal,
  ) -> bool {
    let switched = flow_id != self.last_flow_id.as_deref();
    if !switched
      && (signal.counter <= self.last_applied_counter || signal.source == UpdateSource::Editor)
    {
      self.last_applied_counter = self.last_applied_counter.max(signal.counter);
      return false;
    }

    self.last_flow_id = flow_id.map(str::to_string);
    self.last_applied_counter = signal.counter;

    let text = match document {
      Some(document) => render(document),
      None => String::new(),
    };
    if text == self.text {
      return false;
    }
    self.text = text;
    true
  }

  /// Replace the buffer with user-typed text and parse it into a patch.
  ///
  /// Version metadata in the text is dropped: an edit made against an old
  /// buffer must not move the version backwards.
  pub fn edit(&mut self, text: impl Into<String>) -> Result<FlowPatch, EditorError> {
    self.text = text.into();
    let mut patch: FlowPatch = serde_json::from_str(&self.text)?;
    patch.version = None;
    patch.updated_at = None;
    Ok(patch)
  }
}

fn render(document: &FlowDocument) -> String {
  // Serializing plain data into a String cannot fail.
  serde_json::to_string_pretty(&EditorView::of(document)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowdeck_flow::{FlowNode, NodeType};

  fn signal(counter: u64, source: UpdateSource) -> UpdateSignal {
    UpdateSignal { counter, source }
  }

  fn doc(name: &str) -> FlowDocument {
    let mut doc = FlowDocument::new("flow-1", name);
    doc.nodes = vec![FlowNode::new("t1", NodeType::Trigger, "cron")];
    doc.version = 3;
    doc
  }

  #[test]
  fn test_renders_on_open() {
    let mut editor = EditorSurface::new();
    assert!(editor.apply(Some("flow-1"), Some(&doc("Digest")), signal(1, UpdateSource::Init)));

    let json: serde_json::Value = serde_json::from_str(editor.text()).unwrap();
    assert_eq!(json["name"], "Digest");
    assert_eq!(json["version"], 3);
    assert!(json.get("id").is_none());
  }

  #[test]
  fn test_own_signal_does_not_rerender() {
    let mut editor = EditorSurface::new();
    editor.apply(Some("flow-1"), Some(&doc("Digest")), signal(1, UpdateSource::Init));

    let typed = r#"{"name":   "Typed"}"#;
    editor.edit(typed).unwrap();
    assert!(!editor.apply(
      Some("flow-1"),
      Some(&doc("Typed")),
      signal(2, UpdateSource::Editor)
    ));
    assert_eq!(editor.text(), typed);
  }

  #[test]
  fn test_foreign_signal_rerenders() {
    let mut editor = EditorSurface::new();
    editor.apply(Some("flow-1"), Some(&doc("Digest")), signal(1, UpdateSource::Init));

    assert!(editor.apply(
      Some("flow-1"),
      Some(&doc("Renamed")),
      signal(2, UpdateSource::Canvas)
    ));
    assert!(editor.text().contains("Renamed"));
    assert!(!editor.apply(
      Some("flow-1"),
      Some(&doc("Other")),
      signal(2, UpdateSource::Server)
    ));
  }

  #[test]
  fn test_edit_strips_version() {
    let mut editor = EditorSurface::new();
    let patch = editor
      .edit(r#"{"name": "Typed", "version": 1, "updated_at": "2025-01-01T00:00:00Z"}"#)
      .unwrap();

    assert_eq!(patch.name.as_deref(), Some("Typed"));
    assert!(patch.version.is_none());
    assert!(patch.updated_at.is_none());
  }

  #[test]
  fn test_edit_rejects_invalid_json() {
    let mut editor = EditorSurface::new();
    assert!(matches!(editor.edit("{ nodes: "), Err(EditorError::Parse(_))));
    assert_eq!(editor.text(), "{ nodes: ");
  }
}
