// Numan Thabit 2025
//! Open-loop scheduling and the fixed-size dispatch pool.
//!
//! Request `i` is planned for `epoch + i / rate`. The pool never throttles on its own: a worker
//! picks up the next task as soon as it is free, waits for that task's planned start, and runs it
//! to completion. When every worker is busy past a task's planned start the task starts late, and
//! that drift shows up as start lag on its [`TimingRecord`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConfigError;
use crate::record::{RunClock, TimingRecord};

/// Immutable prompt text. Clones share the same allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query(Arc<str>);

impl Query {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self(Arc::from(text))
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Self(Arc::from(text))
    }
}

impl AsRef<str> for Query {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// A query paired with its planned start, as an offset from the run epoch.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub index: usize,
    pub query: Query,
    pub scheduled_start: Duration,
}

/// Executes one scheduled task to completion and reports its timing.
///
/// Implementations must not fail: per-request errors are captured in the returned record.
pub trait RequestRunner: Send + Sync + 'static {
    fn run(
        &self,
        task: ScheduledTask,
        clock: RunClock,
    ) -> impl Future<Output = TimingRecord> + Send;
}

/// Draw `total` queries uniformly, with replacement, from `candidates`.
pub fn sample_queries(
    candidates: &[String],
    total: usize,
    seed: Option<u64>,
) -> Result<Vec<Query>, ConfigError> {
    let pool: Vec<Query> = candidates
        .iter()
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .map(Query::from)
        .collect();
    if pool.is_empty() {
        return Err(ConfigError::NoQueries);
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Ok((0..total)
        .map(|_| pool[rng.gen_range(0..pool.len())].clone())
        .collect())
}

/// Plan evenly spaced starts: task `i` begins at `i / rate` seconds after the epoch.
pub fn schedule(queries: Vec<Query>, rate: f64) -> Result<Vec<ScheduledTask>, ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::InvalidRate(rate));
    }

    queries
        .into_iter()
        .enumerate()
        .map(|(index, query)| {
            let scheduled_start = Duration::try_from_secs_f64(index as f64 / rate)
                .map_err(|_| ConfigError::InvalidRate(rate))?;
            Ok(ScheduledTask {
                index,
                query,
                scheduled_start,
            })
        })
        .collect()
}

/// Fixed pool of concurrent workers draining a queue of scheduled tasks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(concurrency: usize) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self { concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task and return one record per task once all workers have drained.
    ///
    /// Records come back in completion order per worker, not in schedule order.
    pub async fn run<R: RequestRunner>(
        &self,
        tasks: Vec<ScheduledTask>,
        runner: Arc<R>,
    ) -> Vec<TimingRecord> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let queue = Arc::new(ArrayQueue::new(total));
        for task in tasks {
            if let Err(task) = queue.push(task) {
                warn!(index = task.index, "dispatch queue full; dropping task");
            }
        }

        let workers = self.concurrency.min(total);
        let clock = RunClock::start();
        info!(tasks = total, workers, "dispatch started");

        let handles: Vec<JoinHandle<Vec<TimingRecord>>> = (0..workers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    let mut records = Vec::new();
                    while let Some(task) = queue.pop() {
                        records.push(runner.run(task, clock).await);
                    }
                    records
                })
            })
            .collect();

        let mut records = Vec::with_capacity(total);
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(batch) => records.extend(batch),
                Err(err) => error!(worker, %err, "dispatch worker terminated abnormally"),
            }
        }

        let late = records.iter().filter(|rec| rec.started_late()).count();
        if late > 0 {
            warn!(
                late,
                total = records.len(),
                "requests started behind schedule; pool saturated"
            );
        }
        info!(records = records.len(), "dispatch drained");
        records
    }
}
