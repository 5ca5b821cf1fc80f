//! Render surface reconciliation.
//!
//! The canvas keeps its own copy of the graph, decorated with view state the
//! canonical document never carries (measured size, drag offset, selection).
//! [`MergeEngine::apply`] folds new canonical states into that copy while
//! keeping the decoration of nodes that survive.

use std::collections::{HashMap, HashSet};

use flowdeck_flow::{FlowDocument, FlowEdge, FlowNode, FlowPatch, Position};
use tracing::debug;

use crate::signal::{Snapshot, UpdateSignal, UpdateSource};

/// Measured on-screen size of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Size {
  pub width: f64,
  pub height: f64,
}

impl Size {
  pub fn new(width: f64, height: f64) -> Self {
    Self { width, height }
  }
}

/// Render-only state. Never written back to the canonical document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeView {
  pub measured: Option<Size>,
  pub drag_offset: Option<Position>,
  pub selected: bool,
  pub dragging: bool,
}

/// A canonical node plus its view state.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderNode {
  pub node: FlowNode,
  pub view: NodeView,
}

impl RenderNode {
  fn seeded(node: FlowNode) -> Self {
    Self {
      node,
      view: NodeView::default(),
    }
  }

  /// Where the node is drawn: its canonical position plus any drag offset.
  pub fn display_position(&self) -> Position {
    match self.view.drag_offset {
      Some(offset) => self.node.position.offset(offset),
      None => self.node.position,
    }
  }
}

/// What [`MergeEngine::apply`] did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
  /// Render state was discarded and rebuilt from the document.
  Reseeded,
  /// The canvas produced this state itself; nothing to merge.
  SelfOriginated,
  /// The signal was already applied.
  Stale,
  Reconciled {
    added: usize,
    removed: usize,
    updated: usize,
  },
}

/// The render surface.
#[derive(Debug, Default)]
pub struct MergeEngine {
  nodes: Vec<RenderNode>,
  edges: Vec<FlowEdge>,
  last_applied_counter: u64,
  last_flow_id: Option<String>,
}

impl MergeEngine {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn nodes(&self) -> &[RenderNode] {
    &self.nodes
  }

  pub fn edges(&self) -> &[FlowEdge] {
    &self.edges
  }

  pub fn node(&self, node_id: &str) -> Option<&RenderNode> {
    self.nodes.iter().find(|n| n.node.id == node_id)
  }

  pub fn last_applied_counter(&self) -> u64 {
    self.last_applied_counter
  }

  pub fn flow_id(&self) -> Option<&str> {
    self.last_flow_id.as_deref()
  }

  pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> MergeOutcome {
    self.apply(
      snapshot.flow_id.as_deref(),
      snapshot.document(),
      snapshot.signal,
    )
  }

  /// Fold a canonical state into the render surface.
  pub fn apply(
    &mut self,
    flow_id: Option<&str>,
    document: Option<&FlowDocument>,
    signal: UpdateSignal,
  ) -> MergeOutcome {
    if flow_id != self.last_flow_id.as_deref() {
      self.reseed(flow_id, document, signal);
      return MergeOutcome::Reseeded;
    }

    if signal.counter <= self.last_applied_counter {
      debug!(
        counter = signal.counter,
        last_applied = self.last_applied_counter,
        "skipping stale signal"
      );
      return MergeOutcome::Stale;
    }

    match signal.source {
      UpdateSource::Canvas => {
        self.last_applied_counter = signal.counter;
        MergeOutcome::SelfOriginated
      }
      UpdateSource::Init => {
        self.reseed(flow_id, document, signal);
        MergeOutcome::Reseeded
      }
      _ => {
        let Some(document) = document else {
          self.reseed(flow_id, None, signal);
          return MergeOutcome::Reseeded;
        };
        let outcome = self.reconcile(document);
        self.last_applied_counter = signal.counter;
        outcome
      }
    }
  }

  fn reseed(
    &mut self,
    flow_id: Option<&str>,
    document: Option<&FlowDocument>,
    signal: UpdateSignal,
  ) {
    match document {
      Some(document) => {
        self.nodes = document.nodes.iter().cloned().map(RenderNode::seeded).collect();
        self.edges = document.edges.clone();
      }
      None => {
        self.nodes.clear();
        self.edges.clear();
      }
    }
    self.last_applied_counter = signal.counter;
    self.last_flow_id = flow_id.map(str::to_string);
  }

  fn reconcile(&mut self, document: &FlowDocument) -> MergeOutcome {
    let mut views: HashMap<String, NodeView> = self
      .nodes
      .drain(..)
      .map(|rendered| (rendered.node.id, rendered.view))
      .collect();

    let mut added = 0;
    let mut updated = 0;
    let mut next = Vec::with_capacity(document.nodes.len());
    for node in &document.nodes {
      let view = match views.remove(&node.id) {
        Some(view) => {
          updated += 1;
          view
        }
        None => {
          added += 1;
          NodeView::default()
        }
      };
      next.push(RenderNode {
        node: node.clone(),
        view,
      });
    }

    let removed = views.len();
    self.nodes = next;
    self.edges = document.edges.clone();

    MergeOutcome::Reconciled {
      added,
      removed,
      updated,
    }
  }

  // Canvas callbacks

  /// Select a single node, clearing any previous selection.
  pub fn select(&mut self, node_id: &str) -> bool {
    let mut found = false;
    for rendered in &mut self.nodes {
      rendered.view.selected = rendered.node.id == node_id;
      found |= rendered.view.selected;
    }
    found
  }

  pub fn set_measured(&mut self, node_id: &str, size: Size) -> bool {
    match self.node_mut(node_id) {
      Some(rendered) => {
        rendered.view.measured = Some(size);
        true
      }
      None => false,
    }
  }

  pub fn begin_drag(&mut self, node_id: &str) -> bool {
    match self.node_mut(node_id) {
      Some(rendered) => {
        rendered.view.dragging = true;
        rendered.view.drag_offset = Some(Position::default());
        true
      }
      None => false,
    }
  }

  /// Move a dragged node to `position`, recorded as an offset from its
  /// canonical position.
  pub fn drag_to(&mut self, node_id: &str, position: Position) -> bool {
    match self.node_mut(node_id) {
      Some(rendered) if rendered.view.dragging => {
        let origin = rendered.node.position;
        let offset = Position::new(position.x - origin.x, position.y - origin.y);
        rendered.view.drag_offset = Some(offset);
        true
      }
      _ => false,
    }
  }

  /// Finish a drag, committing the final position into the node. Returns the
  /// canvas snapshot to dispatch, or `None` if the node was not being dragged.
  pub fn end_drag(&mut self, node_id: &str) -> Option<FlowPatch> {
    let rendered = self.node_mut(node_id)?;
    if !rendered.view.dragging {
      return None;
    }

    rendered.node.position = rendered.display_position();
    rendered.view.dragging = false;
    rendered.view.drag_offset = None;
    Some(self.snapshot())
  }

  /// Add a node (palette drop). Replaces any node with the same id.
  pub fn insert_node(&mut self, node: FlowNode) -> FlowPatch {
    match self.node_mut(&node.id) {
      Some(rendered) => rendered.node = node,
      None => self.nodes.push(RenderNode::seeded(node)),
    }
    self.snapshot()
  }

  /// Remove a node and every edge attached to it.
  pub fn remove_node(&mut self, node_id: &str) -> Option<FlowPatch> {
    let index = self.nodes.iter().position(|n| n.node.id == node_id)?;
    self.nodes.remove(index);
    self.edges.retain(|edge| !edge.touches(node_id));
    Some(self.snapshot())
  }

  /// Connect two existing nodes. Returns `None` when an endpoint is missing
  /// or an edge with the same id already exists.
  pub fn connect(&mut self, edge: FlowEdge) -> Option<FlowPatch> {
    let known: HashSet<&str> = self.nodes.iter().map(|n| n.node.id.as_str()).collect();
    if !known.contains(edge.source.as_str()) || !known.contains(edge.target.as_str()) {
      return None;
    }
    if self.edges.iter().any(|e| e.id == edge.id) {
      return None;
    }
    self.edges.push(edge);
    Some(self.snapshot())
  }

  /// The graph as the canvas sees it, with view state stripped.
  pub fn snapshot(&self) -> FlowPatch {
    FlowPatch::graph(
      self.nodes.iter().map(|n| n.node.clone()).collect(),
      self.edges.clone(),
    )
  }

  fn node_mut(&mut self, node_id: &str) -> Option<&mut RenderNode> {
    self.nodes.iter_mut().find(|n| n.node.id == node_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowdeck_flow::NodeType;

  fn signal(counter: u64, source: UpdateSource) -> UpdateSignal {
    UpdateSignal { counter, source }
  }

  fn doc(nodes: &[&str]) -> FlowDocument {
    let mut doc = FlowDocument::new("flow-1", "Digest");
    doc.nodes = nodes
      .iter()
      .map(|id| FlowNode::new(*id, NodeType::Executor, "claude"))
      .collect();
    doc
  }

  fn seeded_engine(nodes: &[&str]) -> MergeEngine {
    let mut engine = MergeEngine::new();
    engine.apply(Some("flow-1"), Some(&doc(nodes)), signal(1, UpdateSource::Init));
    engine
  }

  #[test]
  fn test_switch_reseeds() {
    let mut engine = seeded_engine(&["a"]);
    engine.select("a");

    let mut other = doc(&["x", "y"]);
    other.id = "flow-2".to_string();
    let outcome = engine.apply(Some("flow-2"), Some(&other), signal(2, UpdateSource::Init));

    assert_eq!(outcome, MergeOutcome::Reseeded);
    assert_eq!(engine.flow_id(), Some("flow-2"));
    assert_eq!(engine.nodes().len(), 2);
    assert!(engine.nodes().iter().all(|n| n.view == NodeView::default()));
  }

  #[test]
  fn test_close_clears_surface() {
    let mut engine = seeded_engine(&["a"]);
    let outcome = engine.apply(None, None, signal(1, UpdateSource::Init));

    assert_eq!(outcome, MergeOutcome::Reseeded);
    assert!(engine.nodes().is_empty());
    assert!(engine.flow_id().is_none());
  }

  #[test]
  fn test_canvas_signal_is_self_originated() {
    let mut engine = seeded_engine(&["a"]);
    let outcome = engine.apply(
      Some("flow-1"),
      Some(&doc(&["a", "b"])),
      signal(2, UpdateSource::Canvas),
    );

    assert_eq!(outcome, MergeOutcome::SelfOriginated);
    assert_eq!(engine.last_applied_counter(), 2);
    assert_eq!(engine.nodes().len(), 1);
  }

  #[test]
  fn test_replayed_signal_is_stale() {
    let mut engine = seeded_engine(&["a"]);
    engine.apply(Some("flow-1"), Some(&doc(&["a", "b"])), signal(2, UpdateSource::Server));

    let outcome = engine.apply(
      Some("flow-1"),
      Some(&doc(&["c"])),
      signal(2, UpdateSource::Server),
    );
    assert_eq!(outcome, MergeOutcome::Stale);
    assert_eq!(engine.nodes().len(), 2);
  }

  #[test]
  fn test_reconcile_keeps_view_state() {
    let mut engine = seeded_engine(&["a", "b"]);
    engine.select("a");
    engine.set_measured("a", Size::new(120.0, 40.0));

    let mut next = doc(&["a", "c"]);
    next.nodes[0].label = "Renamed".to_string();
    let outcome = engine.apply(Some("flow-1"), Some(&next), signal(2, UpdateSource::Server));

    assert_eq!(
      outcome,
      MergeOutcome::Reconciled {
        added: 1,
        removed: 1,
        updated: 1,
      }
    );
    let a = engine.node("a").unwrap();
    assert_eq!(a.node.label, "Renamed");
    assert!(a.view.selected);
    assert_eq!(a.view.measured, Some(Size::new(120.0, 40.0)));
    assert_eq!(engine.node("c").unwrap().view, NodeView::default());
    assert!(engine.node("b").is_none());
  }

  #[test]
  fn test_init_for_same_flow_drops_decoration() {
    let mut engine = seeded_engine(&["a"]);
    engine.select("a");

    let outcome = engine.apply(
      Some("flow-1"),
      Some(&doc(&["a"])),
      signal(2, UpdateSource::Init),
    );

    assert_eq!(outcome, MergeOutcome::Reseeded);
    assert!(!engine.node("a").unwrap().view.selected);
  }

  #[test]
  fn test_drag_commits_position() {
    let mut engine = seeded_engine(&["a"]);
    assert!(engine.begin_drag("a"));
    assert!(engine.drag_to("a", Position::new(40.0, 25.0)));
    assert_eq!(engine.node("a").unwrap().display_position(), Position::new(40.0, 25.0));

    let patch = engine.end_drag("a").unwrap();
    let nodes = patch.nodes.unwrap();
    assert_eq!(nodes[0].position, Position::new(40.0, 25.0));
    assert!(engine.node("a").unwrap().view.drag_offset.is_none());
    assert!(engine.end_drag("a").is_none());
  }

  #[test]
  fn test_remove_node_drops_attached_edges() {
    let mut engine = seeded_engine(&["a", "b", "c"]);
    engine.connect(FlowEdge::between("a", "b")).unwrap();
    engine.connect(FlowEdge::between("b", "c")).unwrap();

    let patch = engine.remove_node("b").unwrap();
    assert_eq!(patch.nodes.unwrap().len(), 2);
    assert!(patch.edges.unwrap().is_empty());
    assert!(engine.remove_node("b").is_none());
  }

  #[test]
  fn test_connect_rejects_unknown_and_duplicate() {
    let mut engine = seeded_engine(&["a", "b"]);
    assert!(engine.connect(FlowEdge::between("a", "zz")).is_none());
    assert!(engine.connect(FlowEdge::between("a", "b")).is_some());
    assert!(engine.connect(FlowEdge::between("a", "b")).is_none());
  }

  #[test]
  fn test_insert_node_appends() {
    let mut engine = seeded_engine(&["a"]);
    let sink = FlowNode::new("sink", NodeType::Sink, "slack").at(10.0, 10.0);
    let patch = engine.insert_node(sink);
    let ids: Vec<_> = patch.nodes.unwrap().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec!["a", "sink"]);
  }
}
