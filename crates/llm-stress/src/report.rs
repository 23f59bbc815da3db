// Numan Thabit 2025
//! Run summary: throughput and latency percentiles over every timing record.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::record::TimingRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

impl LatencySummary {
    /// `None` when there are no samples.
    pub fn from_samples(samples: impl IntoIterator<Item = Duration>) -> Option<Self> {
        let mut millis: Vec<f64> = samples.into_iter().map(as_millis).collect();
        millis.sort_by(f64::total_cmp);
        Some(Self {
            mean_ms: mean(&millis)?,
            p95_ms: percentile(&millis, 0.95)?,
            p99_ms: percentile(&millis, 0.99)?,
            samples: millis.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LagSummary {
    pub mean_ms: f64,
    pub max_ms: f64,
    /// Requests sent more than the late-start threshold after their planned start.
    pub late: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub requests: usize,
    pub completed: usize,
    /// Failed requests keyed by outcome label.
    pub failures: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qps: Option<f64>,
    pub span_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_token: Option<LatencySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_lag: Option<LagSummary>,
}

impl Report {
    /// Summarize a finished run. Failed requests count toward throughput but not toward total
    /// latency; first-token statistics only cover records that observed one.
    pub fn from_records(records: &[TimingRecord]) -> Self {
        let mut failures = BTreeMap::new();
        for rec in records.iter().filter(|rec| !rec.outcome.is_success()) {
            *failures.entry(rec.outcome.label()).or_insert(0) += 1;
        }

        let span = run_span(records);
        let lags: Vec<f64> = records.iter().map(|rec| as_millis(rec.start_lag())).collect();
        let start_lag = mean(&lags).map(|mean_ms| LagSummary {
            mean_ms,
            max_ms: lags.iter().copied().fold(0.0, f64::max),
            late: records.iter().filter(|rec| rec.started_late()).count(),
        });

        Self {
            requests: records.len(),
            completed: records.len() - failures.values().sum::<usize>(),
            failures,
            qps: throughput(records.len(), span),
            span_ms: as_millis(span),
            latency: LatencySummary::from_samples(
                records
                    .iter()
                    .filter(|rec| rec.outcome.is_success())
                    .map(TimingRecord::latency),
            ),
            first_token: LatencySummary::from_samples(
                records.iter().filter_map(TimingRecord::first_token_latency),
            ),
            start_lag,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.qps {
            Some(qps) => writeln!(f, "QPS: {qps:.2}")?,
            None => writeln!(f, "QPS: n/a")?,
        }
        if let Some(latency) = &self.latency {
            writeln!(f, "Avg request latency: {:.0}ms", latency.mean_ms)?;
            writeln!(f, "P95 request latency: {:.0}ms", latency.p95_ms)?;
            writeln!(f, "P99 request latency: {:.0}ms", latency.p99_ms)?;
        }
        if let Some(first) = &self.first_token {
            writeln!(f, "Avg first token latency: {:.0}ms", first.mean_ms)?;
            writeln!(f, "P95 first token latency: {:.0}ms", first.p95_ms)?;
            writeln!(f, "P99 first token latency: {:.0}ms", first.p99_ms)?;
        }
        if !self.failures.is_empty() {
            let breakdown: Vec<String> = self
                .failures
                .iter()
                .map(|(label, count)| format!("{label}={count}"))
                .collect();
            writeln!(
                f,
                "Failed requests: {} of {} ({})",
                self.requests - self.completed,
                self.requests,
                breakdown.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Value at index `floor(n * p)` of an ascending slice, clamped to the last element.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() as f64) * p.clamp(0.0, 1.0)).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Requests per second over `span`, or `None` when the span is empty.
pub fn throughput(count: usize, span: Duration) -> Option<f64> {
    if span.is_zero() {
        return None;
    }
    Some(count as f64 * 1000.0 / as_millis(span))
}

/// From the earliest send to the latest end.
fn run_span(records: &[TimingRecord]) -> Duration {
    let first_send = records.iter().map(|rec| rec.send_time).min();
    let last_end = records.iter().map(|rec| rec.end_time).max();
    match (first_send, last_end) {
        (Some(start), Some(end)) => end.saturating_sub(start),
        _ => Duration::ZERO,
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}
