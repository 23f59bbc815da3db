// Numan Thabit 2025
//! Load generator and latency probe for streaming LLM inference servers.
//!
//! A run samples queries, plans them at a fixed arrival rate, pushes them through a bounded pool
//! of workers, and measures send, first-token and completion times from the server's event
//! stream. The [`report::Report`] summarises throughput and latency percentiles.

pub mod backend;
pub mod config;
pub mod executor;
pub mod output;
pub mod record;
pub mod report;
pub mod schedule;
pub mod stream;

pub use backend::{build_backend, Backend, BackendConfig, BackendKind};
pub use config::{CliArgs, ConfigError, RunConfig};
pub use executor::{Executor, TtftMode};
pub use record::{Outcome, RunClock, TimingRecord};
pub use report::Report;
pub use schedule::{sample_queries, schedule, Dispatcher, Query, RequestRunner, ScheduledTask};
