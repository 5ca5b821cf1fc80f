use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource type carried by notifications about flow documents.
pub const FLOW_RESOURCE: &str = "flow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
  Created,
  Updated,
  Deleted,
}

/// A change notification as delivered by the push feed.
///
/// Delivery is at-least-once and unordered; a notification only says that a
/// resource changed, never what changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
  pub resource_type: String,
  pub change_type: ChangeType,
  pub resource_id: String,
  pub timestamp: DateTime<Utc>,
}

impl ChangeNotification {
  pub fn flow(change_type: ChangeType, flow_id: impl Into<String>) -> Self {
    Self {
      resource_type: FLOW_RESOURCE.to_string(),
      change_type,
      resource_id: flow_id.into(),
      timestamp: Utc::now(),
    }
  }

  /// Whether this notification names the given flow.
  pub fn targets_flow(&self, flow_id: &str) -> bool {
    self.resource_type == FLOW_RESOURCE && self.resource_id == flow_id
  }
}
