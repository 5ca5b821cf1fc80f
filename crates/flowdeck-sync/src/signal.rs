use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use flowdeck_flow::FlowDocument;
use serde::{Deserialize, Serialize};

/// Provenance of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
  /// The interactive canvas (render surface).
  Canvas,
  /// The raw text editor.
  Editor,
  /// The remote store, via a save round-trip or the push feed.
  Server,
  /// A full reset when a flow is opened.
  Init,
  /// Programmatic changes from the application itself.
  App,
}

impl UpdateSource {
  /// Whether accepted updates from this source must be written back to the
  /// store. Server and init updates already reflect the store.
  pub fn persists(self) -> bool {
    !matches!(self, UpdateSource::Server | UpdateSource::Init)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      UpdateSource::Canvas => "canvas",
      UpdateSource::Editor => "editor",
      UpdateSource::Server => "server",
      UpdateSource::Init => "init",
      UpdateSource::App => "app",
    }
  }
}

impl fmt::Display for UpdateSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for UpdateSource {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "canvas" => Ok(UpdateSource::Canvas),
      "editor" => Ok(UpdateSource::Editor),
      "server" => Ok(UpdateSource::Server),
      "init" => Ok(UpdateSource::Init),
      "app" => Ok(UpdateSource::App),
      other => Err(format!("unknown update source: {other}")),
    }
  }
}

/// Announces a new canonical state. `counter` totally orders accepted
/// updates within one dispatch core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSignal {
  pub counter: u64,
  pub source: UpdateSource,
}

impl UpdateSignal {
  /// The signal observed before anything was dispatched.
  pub const INITIAL: UpdateSignal = UpdateSignal {
    counter: 0,
    source: UpdateSource::Init,
  };
}

/// What consumers observe: the active flow, its canonical document and the
/// signal that produced it.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub flow_id: Option<String>,
  pub document: Option<Arc<FlowDocument>>,
  pub signal: UpdateSignal,
}

impl Snapshot {
  pub(crate) fn empty() -> Self {
    Self {
      flow_id: None,
      document: None,
      signal: UpdateSignal::INITIAL,
    }
  }

  pub fn document(&self) -> Option<&FlowDocument> {
    self.document.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_persisting_sources() {
    assert!(UpdateSource::Canvas.persists());
    assert!(UpdateSource::Editor.persists());
    assert!(UpdateSource::App.persists());
    assert!(!UpdateSource::Server.persists());
    assert!(!UpdateSource::Init.persists());
  }

  #[test]
  fn test_source_parse_round_trip() {
    for source in [
      UpdateSource::Canvas,
      UpdateSource::Editor,
      UpdateSource::Server,
      UpdateSource::Init,
      UpdateSource::App,
    ] {
      assert_eq!(source.to_string().parse::<UpdateSource>(), Ok(source));
    }
    assert!("disk".parse::<UpdateSource>().is_err());
  }
}
