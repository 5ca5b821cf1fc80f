use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flowdeck_feed::{ChangeFeed, SseChangeFeed};
use flowdeck_flow::FlowDocument;
use flowdeck_store::{FlowStore, HttpFlowStore};
use flowdeck_sync::{
  ChangeFeedAdapter, ChannelNotifier, DispatchOutcome, EditorSurface, FlowSession, MergeEngine,
  SessionConfig, SessionEvent, UpdateSource,
};

const DEFAULT_SERVER_URL: &str = "http://localhost:8081";

/// Flowdeck - keeps a workflow canvas, its JSON editor and the flow server in sync
#[derive(Parser)]
#[command(name = "flowdeck")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.flowdeck)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Base URL of the flow API (overrides config.json)
  #[arg(long, global = true)]
  server: Option<String>,

  /// Quiet period before edits are saved, in milliseconds (overrides config.json)
  #[arg(long, global = true)]
  debounce_ms: Option<u64>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Open a flow and follow changes to it until interrupted
  Watch {
    /// The flow ID to open
    flow_id: String,
  },

  /// Apply a partial update to a flow and save it
  Apply {
    /// The flow ID to update
    flow_id: String,

    /// Path to a JSON patch file (reads stdin when omitted)
    patch_file: Option<PathBuf>,

    /// Surface the update is attributed to (editor, canvas or app)
    #[arg(long, default_value = "editor", value_parser = parse_saved_source)]
    source: UpdateSource,
  },

  /// Print graph analysis for a flow file
  Inspect {
    /// Path to the flow document (JSON)
    flow_file: PathBuf,
  },
}

/// Accept only sources whose updates are written back to the store.
fn parse_saved_source(value: &str) -> Result<UpdateSource, String> {
  let source: UpdateSource = value.parse()?;
  if !source.persists() {
    return Err(format!("'{source}' updates are never saved; use editor, canvas or app"));
  }
  Ok(source)
}

/// Contents of `<data_dir>/config.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
  server_url: Option<String>,
  save_debounce_ms: Option<u64>,
}

/// Settings after merging the config file with command-line flags.
#[derive(Debug)]
struct Settings {
  server_url: String,
  session: SessionConfig,
}

impl Settings {
  fn load(cli: &Cli, data_dir: &Path) -> Result<Self> {
    let path = data_dir.join("config.json");
    let file = if path.exists() {
      let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
      serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
      FileConfig::default()
    };

    let server_url = cli
      .server
      .clone()
      .or(file.server_url)
      .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let mut session = SessionConfig::default();
    if let Some(ms) = cli.debounce_ms.or(file.save_debounce_ms) {
      session = session.with_save_debounce(Duration::from_millis(ms));
    }

    Ok(Self {
      server_url,
      session,
    })
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing();

  let data_dir = match &cli.data_dir {
    Some(dir) => dir.clone(),
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".flowdeck"),
  };
  let settings = Settings::load(&cli, &data_dir)?;

  match cli.command {
    Some(Commands::Watch { flow_id }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(watch_flow(flow_id, settings))?;
    }
    Some(Commands::Apply {
      flow_id,
      patch_file,
      source,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(apply_patch(flow_id, patch_file, source, settings))?;
    }
    Some(Commands::Inspect { flow_file }) => {
      inspect_flow(&flow_file)?;
    }
    None => {
      println!("flowdeck - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_tracing() {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowdeck=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
    .init();
}

/// Client for request/response calls to the flow API.
fn api_client() -> Result<reqwest::Client> {
  reqwest::Client::builder()
    .connect_timeout(Duration::from_secs(10))
    .timeout(Duration::from_secs(30))
    .build()
    .context("failed to build HTTP client")
}

/// Client for the change feed. No overall timeout: the event stream stays
/// open for as long as we watch.
fn feed_client() -> Result<reqwest::Client> {
  reqwest::Client::builder()
    .connect_timeout(Duration::from_secs(10))
    .build()
    .context("failed to build HTTP client")
}

async fn watch_flow(flow_id: String, settings: Settings) -> Result<()> {
  let store: Arc<dyn FlowStore> =
    Arc::new(HttpFlowStore::new(api_client()?, &settings.server_url));
  let feed: Arc<dyn ChangeFeed> =
    Arc::new(SseChangeFeed::new(feed_client()?, &settings.server_url));

  let (session, handle) = FlowSession::new(store.clone(), settings.session);
  let cancel = CancellationToken::new();
  let session_task = tokio::spawn(session.run(cancel.clone()));

  handle
    .open(flow_id.as_str())
    .await
    .with_context(|| format!("failed to open flow '{flow_id}'"))?;

  let adapter = ChangeFeedAdapter::new(feed, store, handle.clone());
  let adapter_task = tokio::spawn(adapter.run(cancel.clone()));

  eprintln!("Watching flow {flow_id} on {} (Ctrl-C to stop)", settings.server_url);

  let mut snapshots = handle.subscribe();
  let mut canvas = MergeEngine::new();
  let mut editor = EditorSurface::new();

  loop {
    let snapshot = snapshots.borrow_and_update().clone();
    let merged = canvas.apply_snapshot(&snapshot);
    let rerendered = editor.apply_snapshot(&snapshot);
    if let Some(document) = snapshot.document() {
      info!(
        flow_id = %document.id,
        counter = snapshot.signal.counter,
        source = %snapshot.signal.source,
        version = document.version,
        nodes = canvas.nodes().len(),
        edges = canvas.edges().len(),
        merge = ?merged,
        rerendered,
        "flow updated"
      );
    }

    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        eprintln!("Stopping");
        break;
      }
      changed = snapshots.changed() => {
        if changed.is_err() {
          break;
        }
      }
    }
  }

  cancel.cancel();
  let _ = session_task.await;
  match adapter_task.await {
    Ok(Err(e)) => error!(error = %e, "change feed failed"),
    Err(e) => error!(error = %e, "change feed task panicked"),
    Ok(Ok(())) => {}
  }

  Ok(())
}

async fn apply_patch(
  flow_id: String,
  patch_file: Option<PathBuf>,
  source: UpdateSource,
  settings: Settings,
) -> Result<()> {
  let text = match patch_file {
    Some(path) => tokio::fs::read_to_string(&path)
      .await
      .with_context(|| format!("failed to read patch file: {}", path.display()))?,
    None => read_patch_from_stdin()?,
  };

  // Parse through the editor surface so version fields in the text are ignored
  let mut editor = EditorSurface::new();
  let patch = editor.edit(text).context("failed to parse patch")?;
  if patch.is_empty() {
    bail!("patch contains no changes");
  }

  let store = Arc::new(HttpFlowStore::new(api_client()?, &settings.server_url));
  let (notifier, mut events) = ChannelNotifier::channel();
  let (session, handle) = FlowSession::with_notifier(store, settings.session, notifier);
  let cancel = CancellationToken::new();
  tokio::spawn(session.run(cancel.clone()));

  handle
    .open(flow_id.as_str())
    .await
    .with_context(|| format!("failed to open flow '{flow_id}'"))?;

  let outcome = handle.dispatch(source, patch).await?;
  let result = match outcome {
    DispatchOutcome::Applied {
      signal,
      persist: true,
    } => {
      eprintln!("Applied update #{} from {}", signal.counter, signal.source);
      handle.flush().await?;
      wait_for_save(&flow_id, &mut events).await
    }
    other => {
      eprintln!("Nothing to save ({other:?})");
      Ok(handle.snapshot().document().map(|d| d.version).unwrap_or_default())
    }
  };
  cancel.cancel();

  println!("{}", result?);
  Ok(())
}

async fn wait_for_save(
  flow_id: &str,
  events: &mut UnboundedReceiver<SessionEvent>,
) -> Result<u64> {
  while let Some(event) = events.recv().await {
    if event.flow_id() != flow_id {
      continue;
    }
    match event {
      SessionEvent::Saved { version, .. } => return Ok(version),
      SessionEvent::SaveFailed { error, .. } => bail!("save failed: {error}"),
      SessionEvent::Rebased { version, .. } => {
        bail!("flow was changed on the server; local update replaced by version {version}")
      }
      SessionEvent::RefetchFailed { error, .. } => {
        bail!("version conflict, and refetching the flow failed: {error}")
      }
      _ => {}
    }
  }
  bail!("flow session stopped before the save completed")
}

fn inspect_flow(flow_file: &Path) -> Result<()> {
  let json = std::fs::read_to_string(flow_file)
    .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
  let document = FlowDocument::from_json(&json)
    .with_context(|| format!("failed to parse flow file: {}", flow_file.display()))?;

  eprintln!(
    "Loaded flow: {} ({} nodes, {} edges, version {})",
    document.name,
    document.nodes.len(),
    document.edges.len(),
    document.version
  );

  let graph = document.graph();
  let mut join_points: Vec<&String> = graph.join_points().iter().collect();
  join_points.sort();

  let (order, levels, cycle) = match (graph.topo_order(), graph.levels()) {
    (Ok(order), Ok(levels)) => (Some(order), Some(levels), None),
    (Err(e), _) | (_, Err(e)) => (None, None, Some(e.to_string())),
  };

  let report = serde_json::json!({
    "entry_points": graph.entry_points(),
    "order": order,
    "levels": levels,
    "join_points": join_points,
    "dangling_edges": graph.dangling_edges(),
    "cycle": cycle,
  });

  println!("{}", serde_json::to_string_pretty(&report)?);

  Ok(())
}

fn read_patch_from_stdin() -> Result<String> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    bail!("no patch file given and nothing piped on stdin");
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read patch from stdin")?;
  Ok(input)
}
