// Numan Thabit 2025
//! Per-request timing records and the monotonic run clock they are measured against.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use serde_with::{serde_as, DurationMilliSecondsWithFrac};
use tokio::time::Instant;

use crate::schedule::Query;

/// Start lag above this is treated as a saturation signal.
pub const LATE_START_THRESHOLD: Duration = Duration::from_millis(1);

/// Monotonic epoch for one run. Every timestamp in a [`TimingRecord`] is an offset from it.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    epoch: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Time elapsed since the epoch.
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Absolute instant for an offset from the epoch.
    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.epoch + offset
    }
}

/// How a single request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Status { code: u16 },
    Transport { message: String },
    Stream { message: String },
    InvalidBody { message: String },
    TimedOut,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// Short label used to bucket failures in the report.
    pub fn label(&self) -> String {
        match self {
            Outcome::Completed => "completed".to_string(),
            Outcome::Status { code } => format!("http_{code}"),
            Outcome::Transport { .. } => "transport".to_string(),
            Outcome::Stream { .. } => "stream".to_string(),
            Outcome::InvalidBody { .. } => "invalid_body".to_string(),
            Outcome::TimedOut => "timed_out".to_string(),
        }
    }
}

/// Result of one executed request.
///
/// Timestamps are offsets from the run's [`RunClock`] epoch, so for every record
/// `send_time <= first_token_time <= end_time` holds by construction.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct TimingRecord {
    pub index: usize,
    pub query: Query,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub scheduled_start: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub send_time: Duration,
    #[serde_as(as = "Option<DurationMilliSecondsWithFrac<f64>>")]
    pub first_token_time: Option<Duration>,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub end_time: Duration,
    pub outcome: Outcome,
    pub events: usize,
    pub skipped_events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Map<String, Value>>,
}

impl TimingRecord {
    /// Total latency (`end - send`).
    pub fn latency(&self) -> Duration {
        self.end_time.saturating_sub(self.send_time)
    }

    /// Time to first token (`first_token - send`), when one was observed.
    pub fn first_token_latency(&self) -> Option<Duration> {
        self.first_token_time
            .map(|first| first.saturating_sub(self.send_time))
    }

    /// How far behind its planned start the request was actually sent.
    pub fn start_lag(&self) -> Duration {
        self.send_time.saturating_sub(self.scheduled_start)
    }

    pub fn started_late(&self) -> bool {
        self.start_lag() > LATE_START_THRESHOLD
    }
}
