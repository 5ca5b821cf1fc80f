use serde::{Deserialize, Serialize};

/// Canvas coordinates of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
  pub x: f64,
  pub y: f64,
}

impl Position {
  pub fn new(x: f64, y: f64) -> Self {
    Self { x, y }
  }

  pub fn offset(self, by: Position) -> Self {
    Self {
      x: self.x + by.x,
      y: self.y + by.y,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
  Trigger,
  Source,
  Filter,
  Executor,
  Sink,
}

/// A node as stored in the canonical document.
///
/// `config` is opaque here; per-kind validation belongs to the node registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
  pub id: String,
  pub node_type: NodeType,
  #[serde(default)]
  pub kind: String,
  #[serde(default)]
  pub label: String,
  #[serde(default)]
  pub config: serde_json::Value,
  #[serde(default)]
  pub position: Position,
}

impl FlowNode {
  pub fn new(id: impl Into<String>, node_type: NodeType, kind: impl Into<String>) -> Self {
    let id = id.into();
    Self {
      label: id.clone(),
      id,
      node_type,
      kind: kind.into(),
      config: serde_json::Value::Object(serde_json::Map::new()),
      position: Position::default(),
    }
  }

  pub fn at(mut self, x: f64, y: f64) -> Self {
    self.position = Position::new(x, y);
    self
  }
}
