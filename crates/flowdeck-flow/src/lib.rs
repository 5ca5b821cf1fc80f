//! Flowdeck Flow
//!
//! This crate contains the flow document model shared by every flowdeck
//! surface: the canonical [`FlowDocument`], its comparable [`FlowContent`],
//! the partial [`FlowPatch`] that surfaces dispatch, and the
//! [`ChangeNotification`] delivered by the push feed.
//!
//! Documents are plain values. Nothing in this crate mutates a document in
//! place on behalf of another surface: [`FlowDocument::merged`] always
//! returns a new value.
//!
//! The [`Graph`] type provides read-only analysis over a document's nodes and
//! edges (entry points, joins, topological order).

mod document;
mod edge;
mod error;
mod graph;
mod node;
mod notification;

pub use document::{FlowContent, FlowDocument, FlowPatch};
pub use edge::FlowEdge;
pub use error::FlowError;
pub use graph::Graph;
pub use node::{FlowNode, NodeType, Position};
pub use notification::{ChangeNotification, ChangeType, FLOW_RESOURCE};
