use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
  #[error("flow graph has a cycle ({sorted} of {total} nodes sorted)")]
  Cycle { sorted: usize, total: usize },

  #[error("invalid flow json: {0}")]
  Json(#[from] serde_json::Error),
}
