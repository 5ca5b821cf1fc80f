use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
  pub id: String,
  pub source: String,
  pub target: String,
}

impl FlowEdge {
  /// Create an edge whose id is derived from its endpoints (`a->b`).
  pub fn between(source: &str, target: &str) -> Self {
    Self {
      id: format!("{source}->{target}"),
      source: source.to_string(),
      target: target.to_string(),
    }
  }

  /// Whether this edge touches the given node.
  pub fn touches(&self, node_id: &str) -> bool {
    self.source == node_id || self.target == node_id
  }
}
