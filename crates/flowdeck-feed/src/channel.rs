use async_trait::async_trait;
use flowdeck_flow::ChangeNotification;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::{ChangeFeed, FeedError, NotificationStream};

/// A feed backed by an in-process broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelChangeFeed {
  sender: broadcast::Sender<ChangeNotification>,
}

impl ChannelChangeFeed {
  pub fn new(sender: broadcast::Sender<ChangeNotification>) -> Self {
    Self { sender }
  }

  /// Publish a notification to every current subscriber.
  pub fn publish(&self, notification: ChangeNotification) {
    // Ignore send errors - there may be no subscribers yet
    let _ = self.sender.send(notification);
  }
}

#[async_trait]
impl ChangeFeed for ChannelChangeFeed {
  async fn subscribe(&self) -> Result<NotificationStream, FeedError> {
    let receiver = self.sender.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
      match receiver.recv().await {
        Ok(notification) => Some((Ok(notification), receiver)),
        Err(RecvError::Lagged(skipped)) => Some((Err(FeedError::Lagged(skipped)), receiver)),
        Err(RecvError::Closed) => None,
      }
    });
    Ok(Box::pin(stream))
  }
}
