// Numan Thabit 2025
//! One full request/response cycle per scheduled task.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sse_codec::SseError;
use thiserror::Error;
use tokio::time::{sleep_until, timeout};
use tracing::debug;

use crate::backend::Backend;
use crate::record::{Outcome, RunClock, TimingRecord};
use crate::schedule::{RequestRunner, ScheduledTask};
use crate::stream::PayloadStream;

const EVENT_STREAM: &str = "text/event-stream";
/// Field dropped from the retained response before reporting.
const STRIPPED_FIELD: &str = "token";

/// Which stream event stamps the first-token time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TtftMode {
    /// First payload that carries generated text.
    #[default]
    FirstContent,
    /// First decoded payload of any kind, including role or control deltas.
    FirstEvent,
}

impl fmt::Display for TtftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TtftMode::FirstContent => "first-content",
            TtftMode::FirstEvent => "first-event",
        })
    }
}

#[derive(Debug, Error)]
pub enum RequestFailure {
    #[error("transport: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("event stream: {0}")]
    Stream(#[from] SseError),
    #[error("response body is not a JSON object: {0}")]
    InvalidBody(#[source] serde_json::Error),
    #[error("request deadline elapsed")]
    TimedOut,
}

impl RequestFailure {
    pub fn into_outcome(self) -> Outcome {
        match self {
            RequestFailure::Transport(err) => Outcome::Transport {
                message: error_chain(&err),
            },
            RequestFailure::Status(status) => Outcome::Status {
                code: status.as_u16(),
            },
            RequestFailure::Stream(err) => Outcome::Stream {
                message: err.to_string(),
            },
            RequestFailure::InvalidBody(err) => Outcome::InvalidBody {
                message: err.to_string(),
            },
            RequestFailure::TimedOut => Outcome::TimedOut,
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Partial observations of one request. Survives a deadline so timestamps seen before it are kept.
#[derive(Debug, Default)]
struct Probe {
    first_token: Option<Duration>,
    events: usize,
    skipped: usize,
    response: Option<Map<String, Value>>,
}

/// HTTP request executor shared by every worker.
pub struct Executor {
    client: Client,
    backend: Arc<dyn Backend>,
    request_timeout: Option<Duration>,
    ttft_mode: TtftMode,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn Backend>,
        request_timeout: Option<Duration>,
        ttft_mode: TtftMode,
        pool_size: usize,
    ) -> reqwest::Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(pool_size)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self::with_client(client, backend, request_timeout, ttft_mode))
    }

    pub fn with_client(
        client: Client,
        backend: Arc<dyn Backend>,
        request_timeout: Option<Duration>,
        ttft_mode: TtftMode,
    ) -> Self {
        Self {
            client,
            backend,
            request_timeout,
            ttft_mode,
        }
    }

    /// Wait for the task's planned start, send it, and record what happened.
    ///
    /// Never fails: transport, status, stream and deadline errors end up in the record's outcome.
    pub async fn execute(&self, task: ScheduledTask, clock: RunClock) -> TimingRecord {
        sleep_until(clock.instant_at(task.scheduled_start)).await;
        let send_time = clock.now();

        let mut probe = Probe::default();
        let result = match self.request_timeout {
            Some(limit) => timeout(limit, self.drive(task.query.as_str(), clock, &mut probe))
                .await
                .unwrap_or(Err(RequestFailure::TimedOut)),
            None => self.drive(task.query.as_str(), clock, &mut probe).await,
        };
        let end_time = clock.now();

        let outcome = match result {
            Ok(()) => Outcome::Completed,
            Err(failure) => failure.into_outcome(),
        };
        let response = if outcome.is_success() {
            probe.response.map(|mut body| {
                body.remove(STRIPPED_FIELD);
                body
            })
        } else {
            None
        };

        let record = TimingRecord {
            index: task.index,
            query: task.query,
            scheduled_start: task.scheduled_start,
            send_time,
            first_token_time: probe.first_token,
            end_time,
            outcome,
            events: probe.events,
            skipped_events: probe.skipped,
            response,
        };
        debug!(
            index = record.index,
            outcome = %record.outcome.label(),
            latency_ms = record.latency().as_millis() as u64,
            first_token_ms = ?record.first_token_latency().map(|d| d.as_millis() as u64),
            start_lag_ms = record.start_lag().as_millis() as u64,
            late = record.started_late(),
            events = record.events,
            "request finished"
        );
        record
    }

    async fn drive(
        &self,
        query: &str,
        clock: RunClock,
        probe: &mut Probe,
    ) -> Result<(), RequestFailure> {
        let response = self
            .backend
            .request(&self.client, query)
            .send()
            .await
            .map_err(RequestFailure::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RequestFailure::Status(status));
        }

        if !is_event_stream(response.headers()) {
            let bytes = response.bytes().await.map_err(RequestFailure::Transport)?;
            let body: Map<String, Value> =
                serde_json::from_slice(&bytes).map_err(RequestFailure::InvalidBody)?;
            probe.response = Some(body);
            return Ok(());
        }

        consume_events(
            response.bytes_stream(),
            self.backend.as_ref(),
            self.ttft_mode,
            clock,
            probe,
        )
        .await
    }
}

impl RequestRunner for Executor {
    fn run(
        &self,
        task: ScheduledTask,
        clock: RunClock,
    ) -> impl Future<Output = TimingRecord> + Send {
        self.execute(task, clock)
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains(EVENT_STREAM))
}

/// Read payloads until the stream ends, stamping the first token once.
async fn consume_events<S, E>(
    bytes: S,
    backend: &dyn Backend,
    mode: TtftMode,
    clock: RunClock,
    probe: &mut Probe,
) -> Result<(), RequestFailure>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut payloads = PayloadStream::new(bytes, backend);
    loop {
        let next = payloads.next_payload().await;
        probe.events = payloads.decoded();
        probe.skipped = payloads.skipped();
        let Some(payload) = next? else {
            break;
        };

        if probe.first_token.is_none() {
            let counts = match mode {
                TtftMode::FirstEvent => true,
                TtftMode::FirstContent => backend.has_content(&payload.body),
            };
            if counts {
                probe.first_token = Some(clock.now());
            }
        }
        probe.response = Some(payload.body);
    }
    debug!(end = ?payloads.end(), events = probe.events, "event stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use futures::StreamExt;
    use tokio::time::sleep;

    use crate::backend::{BackendConfig, BackendKind, ChatCompletions};

    /// Body that yields each chunk after its delay.
    fn timed_body(
        chunks: Vec<(u64, &'static str)>,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures::stream::iter(chunks).then(|(delay_ms, chunk)| async move {
            sleep(Duration::from_millis(delay_ms)).await;
            Ok(Bytes::from_static(chunk.as_bytes()))
        })
    }

    /// Paused timers fire on millisecond ticks, so allow one tick of rounding.
    fn assert_at(actual: Option<Duration>, expected_ms: u64) {
        let actual = actual.expect("timestamp");
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(1),
            "{actual:?} is not at {expected:?}"
        );
    }

    fn chat() -> ChatCompletions {
        ChatCompletions::new(&BackendConfig::with_defaults(BackendKind::Chat))
    }

    const ROLE: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
    const HEL: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n";
    const LO: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}],\"token\":[1]}\n\n";
    const DONE: &str = "data: [DONE]\n\n";

    #[tokio::test(start_paused = true)]
    async fn first_token_is_stamped_once_at_first_event() {
        let clock = RunClock::start();
        let mut probe = Probe::default();
        let body = timed_body(vec![(10, HEL), (20, HEL), (30, LO), (5, DONE)]);

        consume_events(body, &chat(), TtftMode::FirstContent, clock, &mut probe)
            .await
            .expect("stream");

        assert_at(probe.first_token, 10);
        assert_eq!(probe.events, 3);
        assert_eq!(probe.skipped, 0);
        assert!(clock.now() >= Duration::from_millis(65));
    }

    #[tokio::test(start_paused = true)]
    async fn role_only_delta_counts_only_in_first_event_mode() {
        let clock = RunClock::start();
        let mut content = Probe::default();
        consume_events(
            timed_body(vec![(10, ROLE), (40, HEL), (5, DONE)]),
            &chat(),
            TtftMode::FirstContent,
            clock,
            &mut content,
        )
        .await
        .expect("stream");
        assert_at(content.first_token, 50);

        let clock = RunClock::start();
        let mut event = Probe::default();
        consume_events(
            timed_body(vec![(10, ROLE), (40, HEL), (5, DONE)]),
            &chat(),
            TtftMode::FirstEvent,
            clock,
            &mut event,
        )
        .await
        .expect("stream");
        assert_at(event.first_token, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_events_are_skipped_without_stamping() {
        let clock = RunClock::start();
        let mut probe = Probe::default();
        consume_events(
            timed_body(vec![(5, "data: {oops\n\n"), (5, HEL), (5, DONE)]),
            &chat(),
            TtftMode::FirstEvent,
            clock,
            &mut probe,
        )
        .await
        .expect("stream");

        assert_eq!(probe.skipped, 1);
        assert_eq!(probe.events, 1);
        assert_at(probe.first_token, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn last_payload_is_retained() {
        let clock = RunClock::start();
        let mut probe = Probe::default();
        consume_events(
            timed_body(vec![(1, HEL), (1, LO), (1, DONE)]),
            &chat(),
            TtftMode::FirstContent,
            clock,
            &mut probe,
        )
        .await
        .expect("stream");

        let response = probe.response.expect("payload");
        assert!(response.contains_key("token"));
        assert_eq!(response["choices"][0]["delta"]["content"], "lo");
    }

    #[test]
    fn failures_map_to_outcomes() {
        assert_eq!(
            RequestFailure::Status(StatusCode::SERVICE_UNAVAILABLE).into_outcome(),
            Outcome::Status { code: 503 }
        );
        assert_eq!(RequestFailure::TimedOut.into_outcome(), Outcome::TimedOut);
        let err = serde_json::from_str::<Value>("{").expect_err("invalid json");
        assert!(matches!(
            RequestFailure::InvalidBody(err).into_outcome(),
            Outcome::InvalidBody { .. }
        ));
    }

    #[test]
    fn content_type_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers));
        headers.insert(
            CONTENT_TYPE,
            "Text/Event-Stream; charset=utf-8".parse().expect("header"),
        );
        assert!(is_event_stream(&headers));
        headers.insert(CONTENT_TYPE, "application/json".parse().expect("header"));
        assert!(!is_event_stream(&headers));
    }
}
