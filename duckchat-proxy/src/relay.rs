//! Translates the duckchat SSE stream into OpenAI chunks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};
use crate::openai::{new_chunk, stop_chunk};
use crate::types::ApiResponse;

const DATA_PREFIX_LEN: usize = "data: ".len();
const DONE_MARKER: &str = "[DONE]";

/// The downstream side went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Receives rendered `data: ...\n\n` records. A successful write means the
/// record has been handed off to the client.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: String) -> Result<(), SinkClosed>;
}

#[async_trait]
impl ChunkSink for mpsc::Sender<String> {
    async fn write_chunk(&mut self, chunk: String) -> Result<(), SinkClosed> {
        self.send(chunk).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl ChunkSink for Vec<String> {
    async fn write_chunk(&mut self, chunk: String) -> Result<(), SinkClosed> {
        self.push(chunk);
        Ok(())
    }
}

enum LineOutcome {
    Continue,
    Finished,
}

struct Translator<'a, W: ChunkSink + ?Sized> {
    sink: &'a mut W,
    model: &'a str,
    streaming: bool,
    text: String,
}

impl<W: ChunkSink + ?Sized> Translator<'_, W> {
    async fn emit(&mut self, record: String) -> Result<LineOutcome> {
        if !self.streaming {
            return Ok(LineOutcome::Continue);
        }
        match self.sink.write_chunk(record).await {
            Ok(()) => Ok(LineOutcome::Continue),
            Err(SinkClosed) => {
                tracing::debug!("Client went away, abandoning relay");
                Ok(LineOutcome::Finished)
            }
        }
    }

    async fn line(&mut self, raw: &[u8]) -> Result<LineOutcome> {
        if raw.len() < DATA_PREFIX_LEN {
            return Ok(LineOutcome::Continue);
        }
        let payload = String::from_utf8_lossy(&raw[DATA_PREFIX_LEN..]);
        let payload = payload.trim_end();

        if payload.starts_with(DONE_MARKER) {
            if self.streaming {
                let record = format!("data: {}\n\n", stop_chunk("stop", self.model));
                // the stream is over either way
                let _ = self.emit(record).await?;
            }
            return Ok(LineOutcome::Finished);
        }

        let event: ApiResponse = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("Dropping undecodable event: {}", e);
                return Ok(LineOutcome::Continue);
            }
        };
        if event.action != "success" {
            return Err(ProxyError::UpstreamAction(event.action));
        }
        if event.message.is_empty() {
            return Ok(LineOutcome::Continue);
        }

        self.text.push_str(&event.message);
        let model = if event.model.is_empty() { self.model } else { event.model.as_str() };
        let record = format!("data: {}\n\n", new_chunk(&event.message, model));
        self.emit(record).await
    }
}

/// Read the upstream SSE body line by line, forwarding each message as a
/// chunk when `streaming`, and return the concatenated message text.
///
/// Undecodable events are skipped. A broken upstream or a closed sink ends
/// the relay with whatever text was gathered so far; an event whose action is
/// not `success` fails it.
pub async fn relay<S, E, W>(
    upstream: S,
    sink: &mut W,
    model: &str,
    streaming: bool,
) -> Result<String>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
    W: ChunkSink + ?Sized,
{
    let mut translator = Translator {
        sink,
        model,
        streaming,
        text: String::new(),
    };
    let mut buffer: Vec<u8> = Vec::new();
    let mut upstream = std::pin::pin!(upstream);

    'read: while let Some(chunk) = upstream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!("Upstream stream error: {}", err);
                return Ok(translator.text);
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            if let LineOutcome::Finished = translator.line(&line).await? {
                break 'read;
            }
        }
    }

    if !buffer.is_empty() && !matches!(translator.line(&buffer).await?, LineOutcome::Finished) {
        tracing::debug!("Upstream ended without a [DONE] marker");
    }
    Ok(translator.text)
}
