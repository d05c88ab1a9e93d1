//! Server-sent events transport for the real-time channel.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use reqwest::{Client, Url, header};
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::error::SyncError;
use crate::realtime::{FrameStream, PushFrame, PushTransport};

use super::backend::{Credentials, HttpBackend};
use super::error::InfraError;

const DEFAULT_EVENT: &str = "message";

/// Incremental `text/event-stream` parser.
///
/// Lines end in `\n` or `\r\n`; a blank line dispatches the pending event.
/// `:` lines are comments. Multiple `data:` lines are joined with `\n`. Data
/// that is not JSON is passed on as a JSON string.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<PushFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.split_to(end);
            self.buffer.advance(1);
            let line = String::from_utf8_lossy(&line);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<PushFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<PushFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let payload = serde_json::from_str(&data).unwrap_or(Value::String(data));
        Some(PushFrame::new(
            event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            payload,
        ))
    }
}

/// Long-lived `GET` on the events endpoint, decoded as server-sent events.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    url: Url,
    credentials: Credentials,
}

impl SseTransport {
    /// `connect_timeout` bounds connection setup only; the stream itself stays
    /// open indefinitely.
    pub fn new(
        url: Url,
        credentials: Credentials,
        connect_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(HttpBackend::user_agent())
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| InfraError::client(err.to_string()))?;
        Ok(Self {
            client,
            url,
            credentials,
        })
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    async fn open(&self) -> Result<FrameStream, SyncError> {
        let request = self
            .client
            .get(self.url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(SyncError::network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::http(status.as_u16(), body));
        }
        debug!(url = %self.url, "Event stream opened");

        let mut chunks = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        for frame in decoder.push(&chunk) {
                            yield Ok(frame);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "Event stream read failed");
                        yield Err(SyncError::channel(err));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
