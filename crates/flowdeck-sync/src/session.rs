//! The session task: single owner of the dispatch core, the save timer and
//! every in-flight store call.
//!
//! Callers hold a [`SessionHandle`] and talk to the task over a channel.
//! Store calls run in spawned tasks and post their results back as
//! completions; the loop re-checks the active flow and the save ticket before
//! acting on any of them, so a late reply for a flow that is no longer open
//! (or for a save that was superseded) is dropped.

use std::sync::Arc;

use flowdeck_flow::{FlowDocument, FlowPatch};
use flowdeck_store::{FlowStore, StoreError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::dispatch::{DispatchCore, DispatchOutcome, SaveRequest};
use crate::error::SyncError;
use crate::events::{NoopNotifier, SessionEvent, SessionNotifier};
use crate::signal::{Snapshot, UpdateSignal, UpdateSource};

enum Command {
  InitFlow {
    document: FlowDocument,
    reply: oneshot::Sender<UpdateSignal>,
  },
  Open {
    flow_id: String,
    reply: oneshot::Sender<Result<UpdateSignal, SyncError>>,
  },
  Dispatch {
    source: UpdateSource,
    patch: FlowPatch,
    reply: oneshot::Sender<DispatchOutcome>,
  },
  Fetched {
    document: FlowDocument,
    reply: oneshot::Sender<()>,
  },
  Close {
    reply: oneshot::Sender<()>,
  },
  Flush {
    reply: oneshot::Sender<()>,
  },
}

enum Completion {
  Opened {
    generation: u64,
    result: Result<FlowDocument, StoreError>,
  },
  Saved {
    ticket: u64,
    flow_id: String,
    result: Result<FlowDocument, StoreError>,
  },
  Refetched {
    ticket: u64,
    flow_id: String,
    result: Result<FlowDocument, StoreError>,
  },
}

/// Where the session is in the persist cycle. At most one store call per
/// cycle is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavePhase {
  Idle,
  Saving { ticket: u64 },
  /// A save hit a version conflict and the authoritative copy is being
  /// fetched.
  Refetching { ticket: u64 },
}

impl SavePhase {
  fn is_busy(self) -> bool {
    self != SavePhase::Idle
  }
}

struct PendingOpen {
  generation: u64,
  flow_id: String,
  reply: oneshot::Sender<Result<UpdateSignal, SyncError>>,
}

/// Drives one [`DispatchCore`] against a [`FlowStore`].
///
/// Generic over `N: SessionNotifier` to allow different notification
/// strategies. Use [`FlowSession::new`] for a session that discards events.
///
/// # Usage
///
/// ```ignore
/// let (session, handle) = FlowSession::new(store, SessionConfig::default());
/// let cancel = CancellationToken::new();
/// tokio::spawn(session.run(cancel.clone()));
///
/// handle.open("flow-1").await?;
/// handle.dispatch(UpdateSource::Canvas, patch).await?;
/// ```
pub struct FlowSession<N: SessionNotifier = NoopNotifier> {
  core: DispatchCore,
  store: Arc<dyn FlowStore>,
  config: SessionConfig,
  notifier: N,
  commands: mpsc::Receiver<Command>,
  completion_tx: mpsc::UnboundedSender<Completion>,
  completions: mpsc::UnboundedReceiver<Completion>,
  deadline: Option<Instant>,
  phase: SavePhase,
  resave: bool,
  deferred: Option<FlowDocument>,
  next_ticket: u64,
  open_generation: u64,
  pending_open: Option<PendingOpen>,
}

impl FlowSession<NoopNotifier> {
  /// Create a session whose events are discarded.
  pub fn new(store: Arc<dyn FlowStore>, config: SessionConfig) -> (Self, SessionHandle) {
    Self::with_notifier(store, config, NoopNotifier)
  }
}

impl<N: SessionNotifier> FlowSession<N> {
  pub fn with_notifier(
    store: Arc<dyn FlowStore>,
    config: SessionConfig,
    notifier: N,
  ) -> (Self, SessionHandle) {
    let (command_tx, commands) = mpsc::channel(config.command_buffer);
    let (completion_tx, completions) = mpsc::unbounded_channel();
    let core = DispatchCore::new();
    let handle = SessionHandle {
      commands: command_tx,
      snapshots: core.subscribe(),
    };

    let session = Self {
      core,
      store,
      config,
      notifier,
      commands,
      completion_tx,
      completions,
      deadline: None,
      phase: SavePhase::Idle,
      resave: false,
      deferred: None,
      next_ticket: 0,
      open_generation: 0,
      pending_open: None,
    };
    (session, handle)
  }

  /// Run the session loop.
  ///
  /// This blocks until the cancellation token is triggered or every handle is
  /// dropped. A save still waiting on its debounce window is discarded.
  pub async fn run(mut self, cancel: CancellationToken) {
    info!(
      save_debounce_ms = self.config.save_debounce.as_millis() as u64,
      "starting flow session"
    );

    loop {
      let deadline = self.deadline;
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("flow session cancelled");
          break;
        }
        command = self.commands.recv() => {
          match command {
            Some(command) => self.handle_command(command),
            None => {
              info!("all session handles dropped");
              break;
            }
          }
        }
        Some(completion) = self.completions.recv() => {
          self.handle_completion(completion);
        }
        _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
          self.deadline = None;
          self.fire_save();
        }
      }
    }

    if self.deadline.is_some()
      && let Some(flow_id) = self.core.flow_id()
    {
      warn!(flow_id = %flow_id, "discarding unsaved changes on shutdown");
    }
  }

  fn handle_command(&mut self, command: Command) {
    match command {
      Command::InitFlow { document, reply } => {
        self.supersede_open();
        let signal = self.install(document);
        let _ = reply.send(signal);
      }
      Command::Open { flow_id, reply } => self.open(flow_id, reply),
      Command::Dispatch {
        source,
        patch,
        reply,
      } => {
        let outcome = self.core.dispatch(source, patch);
        match outcome {
          DispatchOutcome::Applied {
            signal,
            persist: true,
          } => {
            debug!(
              counter = signal.counter,
              source = %source,
              "update applied, save scheduled"
            );
            self.schedule_save();
          }
          DispatchOutcome::Applied { signal, .. } => {
            debug!(counter = signal.counter, source = %source, "update applied");
          }
          DispatchOutcome::Unchanged | DispatchOutcome::NoActiveDocument => {
            debug!(source = %source, ?outcome, "update dropped");
          }
          DispatchOutcome::VersionAdopted(_) => {}
        }
        let _ = reply.send(outcome);
      }
      Command::Fetched { document, reply } => {
        self.apply_fetched(document);
        let _ = reply.send(());
      }
      Command::Close { reply } => {
        self.supersede_open();
        self.reset_persistence();
        if let Some(flow_id) = self.core.flow_id() {
          info!(flow_id = %flow_id, "closing flow");
        }
        self.core.close();
        let _ = reply.send(());
      }
      Command::Flush { reply } => {
        if self.deadline.take().is_some() {
          self.fire_save();
        }
        let _ = reply.send(());
      }
    }
  }

  fn handle_completion(&mut self, completion: Completion) {
    match completion {
      Completion::Opened { generation, result } => {
        let Some(pending) = self
          .pending_open
          .take_if(|pending| pending.generation == generation)
        else {
          return;
        };

        match result {
          Ok(document) => {
            let signal = self.install(document);
            let _ = pending.reply.send(Ok(signal));
          }
          Err(e) => {
            warn!(flow_id = %pending.flow_id, error = %e, "failed to open flow");
            let _ = pending.reply.send(Err(e.into()));
          }
        }
      }
      Completion::Saved {
        ticket,
        flow_id,
        result,
      } => {
        if !self.owns(SavePhase::Saving { ticket }, &flow_id) {
          debug!(flow_id = %flow_id, "discarding save result for superseded cycle");
          return;
        }
        self.phase = SavePhase::Idle;

        match result {
          Ok(saved) => {
            self.core.adopt_version(saved.version);
            info!(flow_id = %flow_id, version = saved.version, "flow saved");
            self.notifier.notify(SessionEvent::Saved {
              flow_id,
              version: saved.version,
            });
          }
          Err(StoreError::VersionConflict {
            expected, actual, ..
          }) => {
            warn!(
              flow_id = %flow_id,
              expected,
              actual = ?actual,
              "version conflict, refetching"
            );
            self.notifier.notify(SessionEvent::ConflictDetected {
              flow_id: flow_id.clone(),
              expected_version: expected,
            });
            self.refetch(flow_id);
            return;
          }
          Err(e) => {
            error!(flow_id = %flow_id, error = %e, "failed to save flow");
            self.notifier.notify(SessionEvent::SaveFailed {
              flow_id,
              error: e.to_string(),
            });
          }
        }
        self.after_idle();
      }
      Completion::Refetched {
        ticket,
        flow_id,
        result,
      } => {
        if !self.owns(SavePhase::Refetching { ticket }, &flow_id) {
          debug!(flow_id = %flow_id, "discarding refetch for superseded cycle");
          return;
        }
        self.phase = SavePhase::Idle;

        match result {
          Ok(document) => {
            let version = document.version;
            let outcome = self
              .core
              .dispatch(UpdateSource::Server, FlowPatch::from_document(document));
            let changed = matches!(outcome, DispatchOutcome::Applied { .. });
            // The canonical document now matches the store.
            self.deadline = None;
            self.resave = false;
            info!(flow_id = %flow_id, version, changed, "rebased onto server copy");
            self.notifier.notify(SessionEvent::Rebased {
              flow_id,
              version,
              changed,
            });
          }
          Err(e) => {
            error!(flow_id = %flow_id, error = %e, "failed to refetch flow after conflict");
            self.notifier.notify(SessionEvent::RefetchFailed {
              flow_id,
              error: e.to_string(),
            });
          }
        }
        self.after_idle();
      }
    }
  }

  fn open(
    &mut self,
    flow_id: String,
    reply: oneshot::Sender<Result<UpdateSignal, SyncError>>,
  ) {
    self.supersede_open();
    self.open_generation += 1;
    let generation = self.open_generation;
    debug!(flow_id = %flow_id, generation, "opening flow");

    let store = self.store.clone();
    let completions = self.completion_tx.clone();
    let id = flow_id.clone();
    tokio::spawn(async move {
      let result = store.fetch(&id).await;
      let _ = completions.send(Completion::Opened { generation, result });
    });

    self.pending_open = Some(PendingOpen {
      generation,
      flow_id,
      reply,
    });
  }

  fn supersede_open(&mut self) {
    if let Some(pending) = self.pending_open.take() {
      debug!(flow_id = %pending.flow_id, "open superseded");
      let _ = pending.reply.send(Err(SyncError::Superseded(pending.flow_id)));
    }
  }

  /// Switch to `document`, abandoning every save cycle of the previous flow.
  fn install(&mut self, document: FlowDocument) -> UpdateSignal {
    self.reset_persistence();
    let flow_id = document.id.clone();
    let version = document.version;
    let signal = self.core.init_flow(document);
    info!(flow_id = %flow_id, version, counter = signal.counter, "flow opened");
    self
      .notifier
      .notify(SessionEvent::FlowOpened { flow_id, version });
    signal
  }

  fn reset_persistence(&mut self) {
    self.deadline = None;
    self.resave = false;
    self.deferred = None;
    self.phase = SavePhase::Idle;
  }

  fn schedule_save(&mut self) {
    self.deadline = Some(Instant::now() + self.config.save_debounce);
  }

  fn fire_save(&mut self) {
    let Some(SaveRequest {
      flow_id,
      content,
      expected_version,
    }) = self.core.save_request()
    else {
      return;
    };

    if self.phase.is_busy() {
      debug!(flow_id = %flow_id, "save in flight, queueing another");
      self.resave = true;
      return;
    }

    let ticket = self.take_ticket();
    self.phase = SavePhase::Saving { ticket };
    debug!(flow_id = %flow_id, expected_version, "saving flow");
    self.notifier.notify(SessionEvent::SaveStarted {
      flow_id: flow_id.clone(),
      expected_version,
    });

    let store = self.store.clone();
    let completions = self.completion_tx.clone();
    tokio::spawn(async move {
      let result = store.save(&flow_id, &content, expected_version).await;
      let _ = completions.send(Completion::Saved {
        ticket,
        flow_id,
        result,
      });
    });
  }

  fn refetch(&mut self, flow_id: String) {
    let ticket = self.take_ticket();
    self.phase = SavePhase::Refetching { ticket };

    let store = self.store.clone();
    let completions = self.completion_tx.clone();
    tokio::spawn(async move {
      let result = store.fetch(&flow_id).await;
      let _ = completions.send(Completion::Refetched {
        ticket,
        flow_id,
        result,
      });
    });
  }

  /// Work that waited for the current store call to finish.
  fn after_idle(&mut self) {
    if let Some(document) = self.deferred.take() {
      self.apply_fetched(document);
    }
    if self.resave {
      self.resave = false;
      self.fire_save();
    }
  }

  /// Apply a copy fetched because the change feed announced a write.
  ///
  /// Copies that arrive while a save cycle is in flight are held until it
  /// finishes. Copies older than the version this session already knows, or
  /// at the same version but with different content (local edits not yet
  /// saved), are dropped.
  fn apply_fetched(&mut self, document: FlowDocument) {
    if self.core.flow_id() != Some(document.id.as_str()) {
      debug!(flow_id = %document.id, "fetched copy is for an inactive flow");
      return;
    }

    if self.phase.is_busy() {
      if self
        .deferred
        .as_ref()
        .is_none_or(|held| held.version <= document.version)
      {
        self.deferred = Some(document);
      }
      return;
    }

    let known = self.core.version().unwrap_or_default();
    let reason = if document.version < known {
      Some("older than the local version")
    } else if document.version == known
      && self
        .core
        .document()
        .is_some_and(|current| !current.same_content(&document))
    {
      Some("local changes not yet saved")
    } else {
      None
    };

    if let Some(reason) = reason {
      debug!(
        flow_id = %document.id,
        version = document.version,
        known,
        reason,
        "ignoring fetched copy"
      );
      self.notifier.notify(SessionEvent::FetchIgnored {
        flow_id: document.id,
        version: document.version,
        reason: reason.to_string(),
      });
      return;
    }

    self
      .core
      .dispatch(UpdateSource::Server, FlowPatch::from_document(document));
  }

  fn owns(&self, phase: SavePhase, flow_id: &str) -> bool {
    self.phase == phase && self.core.flow_id() == Some(flow_id)
  }

  fn take_ticket(&mut self) -> u64 {
    self.next_ticket += 1;
    self.next_ticket
  }
}

/// Cloneable handle to a running [`FlowSession`].
#[derive(Clone)]
pub struct SessionHandle {
  commands: mpsc::Sender<Command>,
  snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
  /// Install `document` as the canonical document.
  pub async fn init_flow(&self, document: FlowDocument) -> Result<UpdateSignal, SyncError> {
    self
      .request(|reply| Command::InitFlow { document, reply })
      .await
  }

  /// Fetch a flow from the store and install it.
  pub async fn open(&self, flow_id: impl Into<String>) -> Result<UpdateSignal, SyncError> {
    let flow_id = flow_id.into();
    self
      .request(|reply| Command::Open { flow_id, reply })
      .await?
  }

  /// Route an update from a surface through the dispatch core.
  pub async fn dispatch(
    &self,
    source: UpdateSource,
    patch: FlowPatch,
  ) -> Result<DispatchOutcome, SyncError> {
    self
      .request(|reply| Command::Dispatch {
        source,
        patch,
        reply,
      })
      .await
  }

  /// Hand over a copy fetched in response to a change notification.
  pub async fn apply_fetched(&self, document: FlowDocument) -> Result<(), SyncError> {
    self
      .request(|reply| Command::Fetched { document, reply })
      .await
  }

  /// Drop the active flow. Pending saves are discarded.
  pub async fn close(&self) -> Result<(), SyncError> {
    self.request(|reply| Command::Close { reply }).await
  }

  /// Fire a pending save now instead of waiting out the debounce window.
  pub async fn flush(&self) -> Result<(), SyncError> {
    self.request(|reply| Command::Flush { reply }).await
  }

  /// Subscribe to published snapshots.
  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.snapshots.clone()
  }

  /// The latest published snapshot.
  pub fn snapshot(&self) -> Snapshot {
    self.snapshots.borrow().clone()
  }

  pub fn active_flow_id(&self) -> Option<String> {
    self.snapshots.borrow().flow_id.clone()
  }

  async fn request<T>(
    &self,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
  ) -> Result<T, SyncError> {
    let (reply, response) = oneshot::channel();
    self
      .commands
      .send(command(reply))
      .await
      .map_err(|_| SyncError::SessionClosed)?;
    response.await.map_err(|_| SyncError::SessionClosed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowdeck_store::MemoryFlowStore;
  use std::time::Duration;

  fn spawn_session() -> (Arc<MemoryFlowStore>, SessionHandle, CancellationToken) {
    let store = Arc::new(MemoryFlowStore::new());
    let (session, handle) = FlowSession::new(store.clone(), SessionConfig::default());
    let cancel = CancellationToken::new();
    tokio::spawn(session.run(cancel.clone()));
    (store, handle, cancel)
  }

  #[tokio::test]
  async fn test_open_missing_flow() {
    let (_store, handle, _cancel) = spawn_session();
    let err = handle.open("nope").await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::NotFound(_))));
    assert!(handle.active_flow_id().is_none());
  }

  #[tokio::test]
  async fn test_handle_fails_after_cancel() {
    let (_store, handle, cancel) = spawn_session();
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = handle.close().await.unwrap_err();
    assert!(matches!(err, SyncError::SessionClosed));
  }

  #[tokio::test(start_paused = true)]
  async fn test_later_open_supersedes_earlier() {
    let (store, handle, _cancel) = spawn_session();
    store.insert(FlowDocument::new("flow-1", "One"));
    store.insert(FlowDocument::new("flow-2", "Two"));
    store.set_latency(Duration::from_millis(50));

    let first = {
      let handle = handle.clone();
      tokio::spawn(async move { handle.open("flow-1").await })
    };
    tokio::task::yield_now().await;
    let second = handle.open("flow-2").await.unwrap();

    assert!(matches!(
      first.await.unwrap(),
      Err(SyncError::Superseded(id)) if id == "flow-1"
    ));
    assert_eq!(second.source, UpdateSource::Init);
    assert_eq!(handle.active_flow_id().as_deref(), Some("flow-2"));
  }
}
