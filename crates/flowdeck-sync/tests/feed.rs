//! Integration tests for the change feed adapter: echoes of our own saves
//! must not surface as changes, writes from elsewhere must.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_feed::{ChangeFeed, ChannelChangeFeed, FeedError, NotificationStream};
use flowdeck_flow::{
  ChangeNotification, ChangeType, FlowDocument, FlowNode, FlowPatch, NodeType,
};
use flowdeck_store::MemoryFlowStore;
use flowdeck_sync::{
  ChangeFeedAdapter, ChannelNotifier, EditorSurface, FlowSession, MergeEngine, MergeOutcome,
  SessionConfig, SessionEvent, SessionHandle, UpdateSource,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

async fn start() -> (
  Arc<MemoryFlowStore>,
  SessionHandle,
  UnboundedReceiver<SessionEvent>,
  CancellationToken,
) {
  let store = Arc::new(MemoryFlowStore::new());
  let mut doc = FlowDocument::new("flow-1", "Digest");
  doc.nodes = vec![
    FlowNode::new("t1", NodeType::Trigger, "cron"),
    FlowNode::new("e1", NodeType::Executor, "claude"),
  ];
  store.insert(doc);

  let (notifier, events) = ChannelNotifier::channel();
  let (session, handle) =
    FlowSession::with_notifier(store.clone(), SessionConfig::default(), notifier);
  let feed = Arc::new(ChannelChangeFeed::new(store.changes()));
  let adapter = ChangeFeedAdapter::new(feed, store.clone(), handle.clone());

  let cancel = CancellationToken::new();
  tokio::spawn(session.run(cancel.clone()));
  tokio::spawn(adapter.run(cancel.clone()));
  // Let the adapter subscribe before anything is written
  sleep(Duration::from_millis(10)).await;

  handle.open("flow-1").await.unwrap();
  (store, handle, events, cancel)
}

async fn wait_for_saved(events: &mut UnboundedReceiver<SessionEvent>) -> u64 {
  loop {
    let event = timeout(Duration::from_secs(30), events.recv())
      .await
      .expect("timed out waiting for save")
      .expect("event channel closed");
    if let SessionEvent::Saved { version, .. } = event {
      return version;
    }
  }
}

#[tokio::test(start_paused = true)]
async fn test_own_save_does_not_echo() {
  let (store, handle, mut events, cancel) = start().await;

  handle
    .dispatch(UpdateSource::Canvas, FlowPatch::default().with_name("Morning digest"))
    .await
    .unwrap();
  let counter = handle.snapshot().signal.counter;

  assert_eq!(wait_for_saved(&mut events).await, 2);
  sleep(Duration::from_secs(1)).await;

  // The notification for our own save was fetched and absorbed
  assert_eq!(store.fetch_count(), 2);
  let snapshot = handle.snapshot();
  assert_eq!(snapshot.signal.counter, counter);
  assert_eq!(snapshot.signal.source, UpdateSource::Canvas);
  assert_eq!(snapshot.document().unwrap().version, 2);
  assert_eq!(store.saves().len(), 1);

  cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_external_write_reaches_surfaces() {
  let (store, handle, _events, cancel) = start().await;
  let mut snapshots = handle.subscribe();

  let mut canvas = MergeEngine::new();
  let mut editor = EditorSurface::new();
  canvas.apply_snapshot(&snapshots.borrow_and_update());
  editor.apply_snapshot(&snapshots.borrow_and_update());
  canvas.select("e1");

  let mut nodes = store.get("flow-1").unwrap().nodes;
  nodes.push(FlowNode::new("k1", NodeType::Sink, "slack"));
  store
    .write_external("flow-1", FlowPatch::default().with_nodes(nodes))
    .unwrap();

  timeout(Duration::from_secs(30), snapshots.changed())
    .await
    .expect("timed out waiting for server update")
    .unwrap();
  let snapshot = snapshots.borrow_and_update().clone();
  assert_eq!(snapshot.signal.source, UpdateSource::Server);
  assert_eq!(snapshot.document().unwrap().version, 2);

  assert_eq!(
    canvas.apply_snapshot(&snapshot),
    MergeOutcome::Reconciled {
      added: 1,
      removed: 0,
      updated: 2,
    }
  );
  assert!(canvas.node("e1").unwrap().view.selected);
  assert!(editor.apply_snapshot(&snapshot));
  assert!(editor.text().contains("k1"));

  // Server updates are never written back
  sleep(Duration::from_secs(2)).await;
  assert!(store.saves().is_empty());

  cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_notifications_for_other_flows_are_ignored() {
  let (store, handle, _events, cancel) = start().await;
  let feed = ChannelChangeFeed::new(store.changes());
  let counter = handle.snapshot().signal.counter;

  feed.publish(ChangeNotification::flow(ChangeType::Updated, "flow-2"));
  feed.publish(ChangeNotification {
    resource_type: "run".to_string(),
    ..ChangeNotification::flow(ChangeType::Created, "flow-1")
  });
  sleep(Duration::from_secs(1)).await;

  assert_eq!(store.fetch_count(), 1);
  assert_eq!(handle.snapshot().signal.counter, counter);

  cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_deleted_flow_keeps_local_document() {
  let (store, handle, _events, cancel) = start().await;

  store.delete("flow-1");
  sleep(Duration::from_secs(1)).await;

  // The refetch fails with not found; the session carries on
  assert_eq!(store.fetch_count(), 2);
  let snapshot = handle.snapshot();
  assert_eq!(snapshot.flow_id.as_deref(), Some("flow-1"));
  assert_eq!(snapshot.document().unwrap().name, "Digest");

  cancel.cancel();
}

/// A feed whose first subscription ends straight away.
struct DroppingFeed {
  inner: ChannelChangeFeed,
  subscriptions: AtomicUsize,
}

#[async_trait]
impl ChangeFeed for DroppingFeed {
  async fn subscribe(&self) -> Result<NotificationStream, FeedError> {
    if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
      let ended = futures::stream::empty::<Result<ChangeNotification, FeedError>>();
      return Ok(Box::pin(ended));
    }
    self.inner.subscribe().await
  }
}

#[tokio::test(start_paused = true)]
async fn test_adapter_resubscribes_after_feed_ends() {
  let store = Arc::new(MemoryFlowStore::new());
  store.insert(FlowDocument::new("flow-1", "Digest"));

  let (session, handle) = FlowSession::new(store.clone(), SessionConfig::default());
  let feed = Arc::new(DroppingFeed {
    inner: ChannelChangeFeed::new(store.changes()),
    subscriptions: AtomicUsize::new(0),
  });
  let adapter = ChangeFeedAdapter::new(feed.clone(), store.clone(), handle.clone());

  let cancel = CancellationToken::new();
  tokio::spawn(session.run(cancel.clone()));
  let adapter_task = tokio::spawn(adapter.run(cancel.clone()));
  handle.open("flow-1").await.unwrap();

  sleep(Duration::from_secs(2)).await;
  assert_eq!(feed.subscriptions.load(Ordering::SeqCst), 2);

  let mut snapshots = handle.subscribe();
  snapshots.borrow_and_update();
  store
    .write_external("flow-1", FlowPatch::default().with_name("Renamed elsewhere"))
    .unwrap();

  timeout(Duration::from_secs(30), snapshots.changed())
    .await
    .expect("timed out waiting for server update")
    .unwrap();
  let snapshot = snapshots.borrow_and_update().clone();
  assert_eq!(snapshot.signal.source, UpdateSource::Server);
  assert_eq!(snapshot.document().unwrap().name, "Renamed elsewhere");

  cancel.cancel();
  assert!(adapter_task.await.unwrap().is_ok());
}
