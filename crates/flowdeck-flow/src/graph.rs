use std::collections::{HashMap, HashSet, VecDeque};

use crate::edge::FlowEdge;
use crate::error::FlowError;
use crate::node::FlowNode;

/// Graph structure for traversal and analysis.
///
/// Edges whose endpoints are not both present in the node set are kept aside
/// as dangling and take no part in adjacency. Node order follows the document.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Node ids in document order.
  order: Vec<String>,
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Nodes with no incoming edges.
  entry_points: Vec<String>,
  /// Nodes with multiple incoming edges (join points).
  join_points: HashSet<String>,
  /// Edge ids referencing a node that does not exist.
  dangling: Vec<String>,
}

impl Graph {
  /// Build a graph from nodes and edges.
  pub fn new(nodes: &[FlowNode], edges: &[FlowEdge]) -> Self {
    let order: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut dangling = Vec::new();

    // Initialize all nodes
    for node_id in &order {
      adjacency.entry(node_id.clone()).or_default();
      reverse_adjacency.entry(node_id.clone()).or_default();
    }

    for edge in edges {
      if !adjacency.contains_key(&edge.source) || !adjacency.contains_key(&edge.target) {
        dangling.push(edge.id.clone());
        continue;
      }
      adjacency
        .entry(edge.source.clone())
        .or_default()
        .push(edge.target.clone());
      reverse_adjacency
        .entry(edge.target.clone())
        .or_default()
        .push(edge.source.clone());
    }

    let entry_points: Vec<String> = order
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    let join_points: HashSet<String> = reverse_adjacency
      .iter()
      .filter(|(_, incoming)| incoming.len() > 1)
      .map(|(id, _)| id.clone())
      .collect();

    Self {
      order,
      adjacency,
      reverse_adjacency,
      entry_points,
      join_points,
      dangling,
    }
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Check if a node is a join point (has multiple incoming edges).
  pub fn is_join_point(&self, node_id: &str) -> bool {
    self.join_points.contains(node_id)
  }

  /// Get all join points.
  pub fn join_points(&self) -> &HashSet<String> {
    &self.join_points
  }

  /// Ids of edges that reference a missing node.
  pub fn dangling_edges(&self) -> &[String] {
    &self.dangling
  }

  /// Topological order of all nodes (Kahn's algorithm).
  pub fn topo_order(&self) -> Result<Vec<String>, FlowError> {
    let mut in_degree: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();

    let mut queue: VecDeque<&str> = self
      .order
      .iter()
      .map(String::as_str)
      .filter(|id| in_degree.get(id) == Some(&0))
      .collect();

    let mut sorted = Vec::with_capacity(self.order.len());
    while let Some(node_id) = queue.pop_front() {
      sorted.push(node_id.to_string());
      for next in self.downstream(node_id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(next.as_str());
          }
        }
      }
    }

    if sorted.len() != self.order.len() {
      return Err(FlowError::Cycle {
        sorted: sorted.len(),
        total: self.order.len(),
      });
    }

    Ok(sorted)
  }

  /// Group nodes into levels: level 0 holds entry points, level N holds nodes
  /// whose deepest parent sits at level N-1.
  pub fn levels(&self) -> Result<Vec<Vec<String>>, FlowError> {
    let sorted = self.topo_order()?;
    let mut node_level: HashMap<&str, usize> = HashMap::new();
    let mut levels: Vec<Vec<String>> = Vec::new();

    for node_id in &sorted {
      let level = self
        .upstream(node_id)
        .iter()
        .filter_map(|p| node_level.get(p.as_str()))
        .max()
        .map(|m| m + 1)
        .unwrap_or(0);
      node_level.insert(node_id.as_str(), level);

      if levels.len() <= level {
        levels.resize_with(level + 1, Vec::new);
      }
      levels[level].push(node_id.clone());
    }

    Ok(levels)
  }
}
