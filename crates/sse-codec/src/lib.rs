// Numan Thabit 2025
// crates/sse-codec/src/lib.rs
#![forbid(unsafe_code)]
//! Incremental `text/event-stream` decoder.
//!
//! [`SseCodec`] turns raw response bytes into [`SseEvent`]s one blank-line-delimited block at a
//! time, so callers can observe each event the moment its bytes arrive. [`event_stream`] wires the
//! codec onto any fallible byte stream (for example `reqwest::Response::bytes_stream`).

use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Default upper bound for a single line (1 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if the block carried one.
    pub event: Option<String>,
    /// All `data:` lines of the block joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream (persists across events).
    pub id: Option<String>,
    /// Reconnection hint carried by a `retry:` field in this block.
    pub retry: Option<Duration>,
}

#[derive(thiserror::Error, Debug)]
pub enum SseError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },
}

/// `Decoder` for the event-stream wire format.
#[derive(Debug)]
pub struct SseCodec {
    max_line_length: usize,
    // Offset into the buffer already searched for a line terminator.
    scanned: usize,
    bom_checked: bool,
    event_type: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl Default for SseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SseCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            scanned: 0,
            bom_checked: false,
            event_type: None,
            data: String::new(),
            has_data: false,
            last_event_id: None,
            retry: None,
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    fn strip_bom(&mut self, buf: &mut BytesMut) -> bool {
        if self.bom_checked {
            return true;
        }
        if buf.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&buf[..]) {
            // Could still be a BOM; wait for more bytes.
            return false;
        }
        if buf.starts_with(UTF8_BOM) {
            buf.advance(UTF8_BOM.len());
        }
        self.bom_checked = true;
        true
    }

    /// Returns `(line_len, terminator_len)` for the next complete line in `buf`.
    fn find_line_end(&mut self, buf: &BytesMut, eof: bool) -> Option<(usize, usize)> {
        let start = self.scanned.min(buf.len());
        match buf[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            Some(rel) => {
                let idx = start + rel;
                if buf[idx] == b'\n' {
                    return Some((idx, 1));
                }
                match buf.get(idx + 1) {
                    Some(b'\n') => Some((idx, 2)),
                    Some(_) => Some((idx, 1)),
                    None if eof => Some((idx, 1)),
                    None => {
                        // A lone '\r' may be the first half of "\r\n".
                        self.scanned = idx;
                        None
                    }
                }
            }
            None => {
                self.scanned = buf.len();
                None
            }
        }
    }

    fn decode_lines(
        &mut self,
        buf: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<SseEvent>, SseError> {
        if !self.strip_bom(buf) && !eof {
            return Ok(None);
        }
        self.bom_checked = true;

        loop {
            let Some((line_len, term_len)) = self.find_line_end(buf, eof) else {
                if buf.len() > self.max_line_length {
                    return Err(SseError::LineTooLong {
                        limit: self.max_line_length,
                    });
                }
                return Ok(None);
            };
            let line = buf.split_to(line_len);
            buf.advance(term_len);
            self.scanned = 0;

            if line.len() > self.max_line_length {
                return Err(SseError::LineTooLong {
                    limit: self.max_line_length,
                });
            }

            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line[0] == b':' {
            return None;
        }

        let (field, value) = match line.iter().position(|b| *b == b':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &[][..]),
        };
        let value = String::from_utf8_lossy(value);

        match field {
            b"event" => self.event_type = Some(value.into_owned()),
            b"data" => {
                self.data.push_str(&value);
                self.data.push('\n');
                self.has_data = true;
            }
            b"id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.into_owned());
                }
            }
            b"retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(ms) = value.parse::<u64>() {
                        self.retry = Some(Duration::from_millis(ms));
                    }
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            self.event_type = None;
            self.retry = None;
            self.data.clear();
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        self.has_data = false;
        Some(SseEvent {
            event: self.event_type.take(),
            data,
            id: self.last_event_id.clone(),
            retry: self.retry.take(),
        })
    }
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = SseError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_lines(buf, false)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode_lines(buf, true)? {
            return Ok(Some(event));
        }
        if !buf.is_empty() {
            // Final line without a terminator.
            let line = buf.split_to(buf.len());
            self.scanned = 0;
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        // Servers sometimes close without the trailing blank line.
        Ok(self.dispatch())
    }
}

/// Byte stream erased to `io::Result` items so it can back a [`StreamReader`].
pub type BoxByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Framed event stream produced by [`event_stream`].
pub type EventStream = FramedRead<StreamReader<BoxByteStream, Bytes>, SseCodec>;

/// Decode events from a fallible byte stream with the default codec.
pub fn event_stream<S, E>(stream: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    event_stream_with(stream, SseCodec::new())
}

/// Decode events from a fallible byte stream with a caller-provided codec.
pub fn event_stream_with<S, E>(stream: S, codec: SseCodec) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes: BoxByteStream =
        Box::pin(stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));
    FramedRead::new(StreamReader::new(bytes), codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn decode_all(input: &[u8]) -> Vec<SseEvent> {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(event) = codec.decode(&mut buf).expect("decode") {
            out.push(event);
        }
        while let Some(event) = codec.decode_eof(&mut buf).expect("decode_eof") {
            out.push(event);
        }
        out
    }

    #[test]
    fn decodes_single_data_event() {
        let events = decode_all(b"data: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn joins_multiline_data_and_keeps_event_type() {
        let events = decode_all(b"event: delta\ndata: first\ndata:second\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("delta"));
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn ignores_comments_and_dataless_blocks() {
        let events = decode_all(b": keep-alive\n\nevent: ping\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
        assert_eq!(events[0].event, None, "event type resets on empty block");
    }

    #[test]
    fn handles_crlf_and_bare_cr_terminators() {
        let events = decode_all(b"data: one\r\n\r\ndata: two\r\rdata: three\n\n");
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["one", "two", "three"]);
    }

    #[test]
    fn split_crlf_across_chunks_is_one_terminator() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(&b"data: a\r"[..]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(b"\n\r\n");
        let event = codec.decode(&mut buf).expect("decode").expect("event");
        assert_eq!(event.data, "a");
        assert!(buf.is_empty());
    }

    #[test]
    fn incremental_chunks_yield_event_only_when_complete() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::new();
        for chunk in [&b"da"[..], b"ta: hel", b"lo\n"] {
            buf.extend_from_slice(chunk);
            assert!(codec.decode(&mut buf).expect("decode").is_none());
        }
        buf.extend_from_slice(b"\n");
        let event = codec.decode(&mut buf).expect("decode").expect("event");
        assert_eq!(event.data, "hello");
    }

    #[test]
    fn id_persists_and_retry_requires_digits() {
        let events = decode_all(b"id: 7\nretry: 1500\ndata: a\n\nretry: soon\ndata: b\n\n");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].retry, Some(Duration::from_millis(1500)));
        assert_eq!(events[1].id.as_deref(), Some("7"));
        assert_eq!(events[1].retry, None);
    }

    #[test]
    fn strips_leading_bom() {
        let events = decode_all(b"\xEF\xBB\xBFdata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn eof_dispatches_unterminated_event() {
        let events = decode_all(b"data: [DONE]");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn invalid_utf8_is_lossy_not_fatal() {
        let events = decode_all(b"data: \xFFok\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].data.ends_with("ok"));
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut codec = SseCodec::with_max_line_length(8);
        let mut buf = BytesMut::from(&b"data: 0123456789"[..]);
        let err = codec.decode(&mut buf).expect_err("line too long");
        assert!(matches!(err, SseError::LineTooLong { limit: 8 }));
    }

    #[tokio::test]
    async fn event_stream_reassembles_chunked_body() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"n\":")),
            Ok(Bytes::from_static(b"1}\n\ndata: {\"n\":2}\n")),
            Ok(Bytes::from_static(b"\ndata: [DONE]\n\n")),
        ];
        let events: Vec<_> = event_stream(futures::stream::iter(chunks))
            .map(|res| res.expect("event").data)
            .collect()
            .await;
        assert_eq!(events, vec!["{\"n\":1}", "{\"n\":2}", "[DONE]"]);
    }

    #[tokio::test]
    async fn event_stream_surfaces_transport_errors() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut stream = event_stream(futures::stream::iter(chunks));
        assert_eq!(stream.next().await.expect("first").expect("ok").data, "a");
        let err = stream.next().await.expect("second").expect_err("io error");
        assert!(matches!(err, SseError::Io(_)));
    }
}
