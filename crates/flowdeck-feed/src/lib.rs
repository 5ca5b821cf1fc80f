//! Flowdeck Feed
//!
//! This crate provides the push change feed: a stream of
//! [`ChangeNotification`]s announcing that a resource changed on the server.
//! Delivery is at-least-once and unordered, and a notification never carries
//! the changed content; consumers re-fetch what they care about.
//!
//! The [`ChangeFeed`] trait is the transport seam. Implementations:
//! - [`SseChangeFeed`] reads server-sent events from the flow API
//! - [`ChannelChangeFeed`] wraps an in-process broadcast channel

mod channel;
mod sse;

pub use channel::ChannelChangeFeed;
pub use sse::{SseChangeFeed, SseDecoder};

use std::pin::Pin;

use async_trait::async_trait;
use flowdeck_flow::ChangeNotification;
use futures::Stream;

/// A boxed stream of change notifications.
pub type NotificationStream =
  Pin<Box<dyn Stream<Item = Result<ChangeNotification, FeedError>> + Send>>;

/// Error type for feed operations.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
  /// The feed connection failed.
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  /// The server refused the subscription.
  #[error("unexpected status {0}")]
  Status(u16),

  /// An event could not be decoded.
  #[error("malformed notification: {0}")]
  Decode(#[from] serde_json::Error),

  /// The subscriber fell behind and notifications were dropped.
  #[error("feed lagged, {0} notifications skipped")]
  Lagged(u64),
}

/// Push feed transport.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
  /// Open a subscription. The stream ends when the feed closes.
  async fn subscribe(&self) -> Result<NotificationStream, FeedError>;
}
