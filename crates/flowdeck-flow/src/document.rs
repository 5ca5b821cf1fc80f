use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::edge::FlowEdge;
use crate::error::FlowError;
use crate::graph::Graph;
use crate::node::FlowNode;

/// The canonical workflow document.
///
/// `version`, `created_at` and `updated_at` are stamped by the remote store.
/// They are metadata, not content: two documents that differ only there are
/// considered identical by [`FlowDocument::same_content`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDocument {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub nodes: Vec<FlowNode>,
  #[serde(default)]
  pub edges: Vec<FlowEdge>,
  #[serde(default)]
  pub version: u64,
  #[serde(default)]
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub updated_at: DateTime<Utc>,
}

/// The user-editable part of a document, as sent to the store on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContent {
  pub name: String,
  pub description: String,
  pub enabled: bool,
  pub nodes: Vec<FlowNode>,
  pub edges: Vec<FlowEdge>,
}

/// A partial document update. Absent fields are left untouched by
/// [`FlowDocument::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub enabled: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub nodes: Option<Vec<FlowNode>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub edges: Option<Vec<FlowEdge>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
}

impl FlowDocument {
  /// Create an empty, unsaved document.
  pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      description: String::new(),
      enabled: false,
      nodes: Vec::new(),
      edges: Vec::new(),
      version: 0,
      created_at: DateTime::<Utc>::default(),
      updated_at: DateTime::<Utc>::default(),
    }
  }

  /// Parse a document from JSON.
  pub fn from_json(json: &str) -> Result<Self, FlowError> {
    Ok(serde_json::from_str(json)?)
  }

  /// Extract the comparable content of this document.
  pub fn content(&self) -> FlowContent {
    FlowContent {
      name: self.name.clone(),
      description: self.description.clone(),
      enabled: self.enabled,
      nodes: self.nodes.clone(),
      edges: self.edges.clone(),
    }
  }

  /// Whether both documents carry the same content, ignoring identity,
  /// version and timestamps.
  pub fn same_content(&self, other: &FlowDocument) -> bool {
    self.name == other.name
      && self.description == other.description
      && self.enabled == other.enabled
      && self.nodes == other.nodes
      && self.edges == other.edges
  }

  /// Return a new document with every field present in `patch` replaced.
  pub fn merged(&self, patch: FlowPatch) -> FlowDocument {
    let mut next = self.clone();
    if let Some(name) = patch.name {
      next.name = name;
    }
    if let Some(description) = patch.description {
      next.description = description;
    }
    if let Some(enabled) = patch.enabled {
      next.enabled = enabled;
    }
    if let Some(nodes) = patch.nodes {
      next.nodes = nodes;
    }
    if let Some(edges) = patch.edges {
      next.edges = edges;
    }
    if let Some(version) = patch.version {
      next.version = version;
    }
    if let Some(updated_at) = patch.updated_at {
      next.updated_at = updated_at;
    }
    next
  }

  /// Build the graph structure for analysis.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.nodes, &self.edges)
  }
}

impl FlowPatch {
  /// A patch carrying every field of `document` except its identity.
  ///
  /// Used when an authoritative copy fetched from the store is routed back
  /// through the ordinary update path.
  pub fn from_document(document: FlowDocument) -> Self {
    Self {
      name: Some(document.name),
      description: Some(document.description),
      enabled: Some(document.enabled),
      nodes: Some(document.nodes),
      edges: Some(document.edges),
      version: Some(document.version),
      updated_at: Some(document.updated_at),
    }
  }

  /// A patch replacing the node and edge sets.
  pub fn graph(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Self {
    Self {
      nodes: Some(nodes),
      edges: Some(edges),
      ..Default::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_nodes(mut self, nodes: Vec<FlowNode>) -> Self {
    self.nodes = Some(nodes);
    self
  }

  pub fn with_version(mut self, version: u64) -> Self {
    self.version = Some(version);
    self
  }

  pub fn is_empty(&self) -> bool {
    *self == FlowPatch::default()
  }
}

impl From<FlowContent> for FlowPatch {
  fn from(content: FlowContent) -> Self {
    Self {
      name: Some(content.name),
      description: Some(content.description),
      enabled: Some(content.enabled),
      nodes: Some(content.nodes),
      edges: Some(content.edges),
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::NodeType;

  fn test_document() -> FlowDocument {
    let mut doc = FlowDocument::new("flow-1", "Daily digest");
    doc.nodes = vec![
      FlowNode::new("t1", NodeType::Trigger, "cron"),
      FlowNode::new("k1", NodeType::Sink, "slack"),
    ];
    doc.edges = vec![FlowEdge::between("t1", "k1")];
    doc.version = 3;
    doc
  }

  #[test]
  fn test_merged_replaces_only_present_fields() {
    let doc = test_document();
    let next = doc.merged(FlowPatch::default().with_name("Weekly digest"));

    assert_eq!(next.name, "Weekly digest");
    assert_eq!(next.nodes, doc.nodes);
    assert_eq!(next.edges, doc.edges);
    assert_eq!(next.version, 3);
    // Original is untouched
    assert_eq!(doc.name, "Daily digest");
  }

  #[test]
  fn test_same_content_ignores_metadata() {
    let doc = test_document();
    let mut other = doc.clone();
    other.id = "flow-2".to_string();
    other.version = 9;
    other.updated_at = Utc::now();

    assert!(doc.same_content(&other));

    other.enabled = true;
    assert!(!doc.same_content(&other));
  }

  #[test]
  fn test_patch_from_document_round_trips_content() {
    let doc = test_document();
    let patch = FlowPatch::from_document(doc.clone());
    let rebuilt = FlowDocument::new("flow-1", "").merged(patch);

    assert!(rebuilt.same_content(&doc));
    assert_eq!(rebuilt.version, 3);
  }

  #[test]
  fn test_patch_deserializes_partial_json() {
    let patch: FlowPatch = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
    assert_eq!(patch.enabled, Some(true));
    assert!(patch.nodes.is_none());
    assert!(!patch.is_empty());
    assert!(FlowPatch::default().is_empty());
  }

  #[test]
  fn test_document_from_json_defaults_metadata() {
    let doc = FlowDocument::from_json(
      r#"{"id": "f", "name": "n", "nodes": [{"id": "a", "node_type": "trigger"}]}"#,
    )
    .unwrap();

    assert_eq!(doc.version, 0);
    assert_eq!(doc.nodes[0].node_type, NodeType::Trigger);
    assert_eq!(doc.nodes[0].id, "a");
    assert!(doc.edges.is_empty());
  }
}
