//! Flowdeck Sync
//!
//! This crate keeps the three views of a flow (the canvas, the text editor
//! and the remote store) consistent with one canonical document.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────────────────┐
//! │ MergeEngine  │   │ EditorSurface│   │ ChangeFeedAdapter           │
//! │ (canvas)     │   │ (text)       │   │ notification -> fetch       │
//! └──────┬───────┘   └──────┬───────┘   └──────────────┬──────────────┘
//!        │ dispatch         │ dispatch                 │ apply_fetched
//!        ▼                  ▼                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      FlowSession (one task)                     │
//! │  - DispatchCore: canonical document, counter, version           │
//! │  - debounced save, conflict refetch                             │
//! └─────────────────────────────────────────────────────────────────┘
//!        │ watch::Receiver<Snapshot>
//!        ▼
//!   every surface re-reads the canonical document on each signal
//! ```
//!
//! Each accepted update gets a signal `{counter, source}`. Surfaces use the
//! counter to drop stale signals and the source to skip re-rendering their
//! own changes. Updates that change nothing but the version are absorbed
//! without a signal, which is what stops save round-trips from echoing.

mod adapter;
mod config;
mod dispatch;
mod editor;
mod error;
mod events;
mod merge;
mod session;
mod signal;

pub use adapter::ChangeFeedAdapter;
pub use config::SessionConfig;
pub use dispatch::{DispatchCore, DispatchOutcome, SaveRequest};
pub use editor::{EditorError, EditorSurface};
pub use error::SyncError;
pub use events::{ChannelNotifier, NoopNotifier, SessionEvent, SessionNotifier};
pub use merge::{MergeEngine, MergeOutcome, NodeView, RenderNode, Size};
pub use session::{FlowSession, SessionHandle};
pub use signal::{Snapshot, UpdateSignal, UpdateSource};
