use std::collections::VecDeque;

use async_trait::async_trait;
use flowdeck_flow::ChangeNotification;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

use crate::{ChangeFeed, FeedError, NotificationStream};

/// Incremental decoder for a `text/event-stream` body.
///
/// Only `data:` fields are kept; every other field and comment is dropped.
/// An event is complete at the first blank line after at least one data line.
/// Bytes are buffered until a full line arrives, so a character split across
/// chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
  buffer: Vec<u8>,
  data: Vec<String>,
}

impl SseDecoder {
  /// Feed a chunk of bytes; returns the payloads of every event completed by it.
  pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
    self.buffer.extend_from_slice(chunk);

    let mut events = Vec::new();
    while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
      let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
      let Ok(line) = std::str::from_utf8(&raw) else {
        warn!(len = raw.len(), "skipping event stream line that is not valid UTF-8");
        continue;
      };
      let line = line.trim_end_matches(['\n', '\r']);

      if line.is_empty() {
        if !self.data.is_empty() {
          events.push(self.data.join("\n"));
          self.data.clear();
        }
      } else if let Some(value) = line.strip_prefix("data:") {
        self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
      }
    }
    events
  }
}

/// Feed reading server-sent events from `GET {base}/api/changes`.
pub struct SseChangeFeed {
  client: Client,
  base_url: String,
}

impl SseChangeFeed {
  pub fn new(client: Client, base_url: impl Into<String>) -> Self {
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Self { client, base_url }
  }

  fn changes_url(&self) -> String {
    format!("{}/api/changes", self.base_url)
  }
}

#[async_trait]
impl ChangeFeed for SseChangeFeed {
  async fn subscribe(&self) -> Result<NotificationStream, FeedError> {
    let response = self
      .client
      .get(self.changes_url())
      .header(ACCEPT, "text/event-stream")
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(FeedError::Status(response.status().as_u16()));
    }

    let bytes = Box::pin(response.bytes_stream());
    let state = (bytes, SseDecoder::default(), VecDeque::<String>::new());

    let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
      loop {
        if let Some(payload) = pending.pop_front() {
          let item = serde_json::from_str::<ChangeNotification>(&payload).map_err(|e| {
            debug!(payload = %payload, "dropping malformed change event");
            FeedError::from(e)
          });
          return Some((item, (bytes, decoder, pending)));
        }

        match bytes.next().await {
          Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
          Some(Err(e)) => return Some((Err(FeedError::Transport(e)), (bytes, decoder, pending))),
          None => return None,
        }
      }
    });

    Ok(Box::pin(stream))
  }
}
