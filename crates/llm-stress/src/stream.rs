// Numan Thabit 2025
//! Turns a streaming response body into backend payloads.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use sse_codec::{event_stream, EventStream, SseError};
use tracing::debug;

use crate::backend::Backend;

/// One decoded event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub body: Map<String, Value>,
    /// Set when the backend marked this payload as the last one.
    pub terminal: bool,
}

/// Why the payload stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The backend's raw sentinel event arrived.
    Sentinel,
    /// A payload the backend considers terminal was yielded.
    Terminal,
    /// The server closed the connection.
    Closed,
}

/// Pull-based parser over one response body. Not restartable once it has ended.
pub struct PayloadStream<'a> {
    events: EventStream,
    backend: &'a dyn Backend,
    decoded: usize,
    skipped: usize,
    end: Option<StreamEnd>,
}

impl<'a> PayloadStream<'a> {
    pub fn new<S, E>(bytes: S, backend: &'a dyn Backend) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            events: event_stream(bytes),
            backend,
            decoded: 0,
            skipped: 0,
            end: None,
        }
    }

    /// Next structured payload, or `None` once the stream has ended.
    ///
    /// Events whose data is not a JSON object are counted as skipped and never yielded.
    pub async fn next_payload(&mut self) -> Result<Option<Payload>, SseError> {
        if self.end.is_some() {
            return Ok(None);
        }

        while let Some(event) = self.events.next().await {
            let event = event?;
            if self.backend.is_sentinel(&event.data) {
                self.end = Some(StreamEnd::Sentinel);
                return Ok(None);
            }

            let body = match serde_json::from_str::<Value>(&event.data) {
                Ok(Value::Object(body)) => body,
                Ok(other) => {
                    self.skipped += 1;
                    debug!(kind = json_kind(&other), "skipping non-object event payload");
                    continue;
                }
                Err(err) => {
                    self.skipped += 1;
                    debug!(%err, len = event.data.len(), "skipping undecodable event payload");
                    continue;
                }
            };

            self.decoded += 1;
            let terminal = self.backend.is_terminal(&body);
            if terminal {
                self.end = Some(StreamEnd::Terminal);
            }
            return Ok(Some(Payload { body, terminal }));
        }

        self.end = Some(StreamEnd::Closed);
        Ok(None)
    }

    pub fn decoded(&self) -> usize {
        self.decoded
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::io;

    use crate::backend::{BackendConfig, BackendKind, ChatCompletions, GenerateStream};

    fn body(chunks: &[&'static str]) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let chunks: Vec<Result<Bytes, Infallible>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        futures::stream::iter(chunks)
    }

    async fn drain(stream: &mut PayloadStream<'_>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Some(payload) = stream.next_payload().await.expect("payload") {
            out.push(payload);
        }
        out
    }

    #[tokio::test]
    async fn chat_stream_stops_at_done_sentinel() {
        let chat = ChatCompletions::new(&BackendConfig::with_defaults(BackendKind::Chat));
        let mut stream = PayloadStream::new(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
                "data: {\"choices\":[{\"del",
                "ta\":{\"content\":\"b\"}}]}\n\ndata: [DONE]\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
            ]),
            &chat,
        );

        let payloads = drain(&mut stream).await;
        assert_eq!(payloads.len(), 2);
        assert!(payloads.iter().all(|p| !p.terminal));
        assert_eq!(stream.end(), Some(StreamEnd::Sentinel));
        assert_eq!(stream.decoded(), 2);
        assert!(stream.next_payload().await.expect("ended").is_none());
    }

    #[tokio::test]
    async fn generate_stream_ends_on_terminal_payload() {
        let gen = GenerateStream::new(&BackendConfig::with_defaults(BackendKind::Generate));
        let mut stream = PayloadStream::new(
            body(&[
                "data:{\"token\":{\"text\":\"x\"},\"generated_text\":null}\n\n",
                "data:{\"token\":{\"text\":\"y\"},\"generated_text\":\"xy\"}\n\n",
                "data:{\"token\":{\"text\":\"z\"}}\n\n",
            ]),
            &gen,
        );

        let payloads = drain(&mut stream).await;
        assert_eq!(payloads.len(), 2);
        assert!(payloads[1].terminal);
        assert_eq!(payloads[1].body["generated_text"], "xy");
        assert_eq!(stream.end(), Some(StreamEnd::Terminal));
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped_and_counted() {
        let chat = ChatCompletions::new(&BackendConfig::with_defaults(BackendKind::Chat));
        let mut stream = PayloadStream::new(
            body(&[
                ": keep-alive\n\n",
                "data: {not json\n\n",
                "data: [1,2]\n\n",
                "data: {\"choices\":[]}\n\n",
            ]),
            &chat,
        );

        let payloads = drain(&mut stream).await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(stream.skipped(), 2);
        assert_eq!(stream.end(), Some(StreamEnd::Closed));
    }

    #[tokio::test]
    async fn transport_errors_surface_as_io() {
        let chat = ChatCompletions::new(&BackendConfig::with_defaults(BackendKind::Chat));
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut stream = PayloadStream::new(futures::stream::iter(chunks), &chat);

        assert!(stream.next_payload().await.expect("first").is_some());
        let err = stream.next_payload().await.expect_err("reset");
        assert!(matches!(err, SseError::Io(_)));
    }
}
