//! Bridges the push change feed into a session.

use std::sync::Arc;
use std::time::Duration;

use flowdeck_feed::{ChangeFeed, FeedError, NotificationStream};
use flowdeck_store::FlowStore;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::session::SessionHandle;

const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Why forwarding from one subscription stopped.
enum Stopped {
  Cancelled,
  SessionClosed,
  FeedEnded,
}

/// Turns change notifications for the active flow into server updates.
///
/// Notifications carry no content, so every one that names the active flow
/// triggers a fetch. Whether the fetched copy is an echo of our own save is
/// decided by the session, not here.
pub struct ChangeFeedAdapter {
  feed: Arc<dyn ChangeFeed>,
  store: Arc<dyn FlowStore>,
  session: SessionHandle,
}

impl ChangeFeedAdapter {
  pub fn new(
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn FlowStore>,
    session: SessionHandle,
  ) -> Self {
    Self {
      feed,
      store,
      session,
    }
  }

  /// Forward notifications until cancelled or the session closes.
  ///
  /// The first subscription must succeed. When the feed ends later, the
  /// adapter subscribes again with a growing delay between attempts.
  pub async fn run(self, cancel: CancellationToken) -> Result<(), FeedError> {
    let mut notifications = self.feed.subscribe().await?;
    info!("change feed subscribed");

    loop {
      match self.forward(&mut notifications, &cancel).await {
        Stopped::Cancelled => {
          info!("change feed adapter cancelled");
          return Ok(());
        }
        Stopped::SessionClosed => {
          info!("session closed, stopping change feed adapter");
          return Ok(());
        }
        Stopped::FeedEnded => warn!("change feed closed, resubscribing"),
      }

      match self.resubscribe(&cancel).await {
        Some(stream) => notifications = stream,
        None => {
          info!("change feed adapter cancelled");
          return Ok(());
        }
      }
    }
  }

  /// Subscribe again, backing off between failed attempts. Returns `None`
  /// when cancelled first.
  async fn resubscribe(&self, cancel: &CancellationToken) -> Option<NotificationStream> {
    let mut delay = INITIAL_RESUBSCRIBE_DELAY;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return None,
        _ = tokio::time::sleep(delay) => {}
      }

      match self.feed.subscribe().await {
        Ok(stream) => {
          info!("change feed resubscribed");
          return Some(stream);
        }
        Err(e) => {
          warn!(
            error = %e,
            retry_in_ms = delay.as_millis() as u64,
            "failed to resubscribe to change feed"
          );
          delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
        }
      }
    }
  }

  async fn forward(
    &self,
    notifications: &mut NotificationStream,
    cancel: &CancellationToken,
  ) -> Stopped {
    loop {
      let notification = tokio::select! {
        _ = cancel.cancelled() => return Stopped::Cancelled,
        next = notifications.next() => match next {
          Some(Ok(notification)) => notification,
          Some(Err(e)) => {
            warn!(error = %e, "change feed error");
            continue;
          }
          None => return Stopped::FeedEnded,
        },
      };

      // Read the active flow now, not when the subscription started.
      let Some(flow_id) = self.session.active_flow_id() else {
        continue;
      };
      if !notification.targets_flow(&flow_id) {
        continue;
      }

      debug!(
        flow_id = %flow_id,
        change_type = ?notification.change_type,
        "change notification, refetching"
      );
      match self.store.fetch(&flow_id).await {
        Ok(document) => {
          if let Err(SyncError::SessionClosed) = self.session.apply_fetched(document).await {
            return Stopped::SessionClosed;
          }
        }
        Err(e) => warn!(flow_id = %flow_id, error = %e, "failed to refetch flow"),
      }
    }
  }
}
