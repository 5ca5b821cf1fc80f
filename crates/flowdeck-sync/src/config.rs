use std::time::Duration;

/// Configuration for a flow session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
  /// Quiet period after the last persisting update before the flow is saved.
  pub save_debounce: Duration,
  /// Capacity of the command channel between handles and the session task.
  pub command_buffer: usize,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      save_debounce: Duration::from_millis(500),
      command_buffer: 100,
    }
  }
}

impl SessionConfig {
  pub fn with_save_debounce(mut self, save_debounce: Duration) -> Self {
    self.save_debounce = save_debounce;
    self
  }
}
