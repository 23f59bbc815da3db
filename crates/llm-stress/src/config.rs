// Numan Thabit 2025
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::backend::{
    BackendConfig, BackendKind, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT,
};
use crate::executor::TtftMode;

pub const DEFAULT_QUERY: &str = "呼吸道能够使气体变得清洁的原因";
pub const DEFAULT_CONCURRENCY: usize = 100;
pub const DEFAULT_RATE: f64 = 300.0;
pub const DEFAULT_TOTAL_REQUESTS: usize = 500;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONFIG_PATH: &str = "llm-stress.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rate must be a positive, finite number of requests per second (got {0})")]
    InvalidRate(f64),
    #[error("concurrency must be greater than 0")]
    ZeroConcurrency,
    #[error("total_requests must be greater than 0")]
    ZeroRequests,
    #[error("no non-blank queries to sample from")]
    NoQueries,
    #[error("max_tokens must be greater than 0")]
    ZeroMaxTokens,
    #[error("invalid endpoint {url}: {source}")]
    InvalidEndpoint {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("endpoint scheme must be http or https (got {0})")]
    UnsupportedScheme(String),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Open-loop load generator and latency probe for streaming LLM inference servers",
    rename_all = "kebab-case"
)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long, value_name = "PATH", env = "LLM_STRESS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server flavour to speak.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Full URL of the streaming endpoint (defaults depend on --backend).
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Model name sent with chat requests.
    #[arg(long)]
    pub model: Option<String>,

    /// System prompt for chat requests (empty string omits the system message).
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Generation bound per request (`max_tokens` / `max_new_tokens`).
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Bearer token for chat endpoints.
    #[arg(long, env = "LLM_STRESS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Query text; repeat to build the candidate pool.
    #[arg(long = "query", value_name = "TEXT")]
    pub queries: Vec<String>,

    /// File with one query per non-blank line.
    #[arg(long, value_name = "PATH")]
    pub queries_file: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Target dispatch rate in requests per second.
    #[arg(long)]
    pub rate: Option<f64>,

    /// Number of requests to send.
    #[arg(long)]
    pub total_requests: Option<usize>,

    /// Seed for reproducible query selection.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Per-request deadline, e.g. `30s` (`0s` disables).
    #[arg(long, value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Which event marks the first token.
    #[arg(long, value_enum)]
    pub ttft_mode: Option<TtftMode>,

    /// Write the report and every timing record as JSON.
    #[arg(long, value_name = "PATH")]
    pub output_json: Option<PathBuf>,

    /// Resolve configuration and build the schedule without sending requests.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[serde_as]
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    backend: Option<BackendKind>,
    endpoint: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    api_key: Option<String>,
    queries: Option<Vec<String>>,
    queries_file: Option<PathBuf>,
    concurrency: Option<usize>,
    rate: Option<f64>,
    total_requests: Option<usize>,
    seed: Option<u64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    request_timeout: Option<humantime::Duration>,
    ttft_mode: Option<TtftMode>,
    output_json: Option<PathBuf>,
}

/// Fully resolved run settings.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub backend: BackendConfig,
    pub queries: Vec<String>,
    pub concurrency: usize,
    pub rate: f64,
    pub total_requests: usize,
    pub seed: Option<u64>,
    pub request_timeout: Option<Duration>,
    pub ttft_mode: TtftMode,
    pub output_json: Option<PathBuf>,
    pub dry_run: bool,
    pub config_path: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_cli(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file_cfg = load_file_config(cli.config.as_deref())?;
        let config = merge(cli, file_cfg)?;
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ConfigError::InvalidRate(self.rate));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.total_requests == 0 {
            return Err(ConfigError::ZeroRequests);
        }
        if self.backend.max_tokens == 0 {
            return Err(ConfigError::ZeroMaxTokens);
        }
        if self.queries.iter().all(|query| query.trim().is_empty()) {
            return Err(ConfigError::NoQueries);
        }
        match self.backend.endpoint.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn log_summary(&self) {
        info!(
            backend = %self.backend.kind,
            endpoint = %self.backend.endpoint,
            model = %self.backend.model,
            max_tokens = self.backend.max_tokens,
            auth = self.backend.api_key.is_some(),
            queries = self.queries.len(),
            concurrency = self.concurrency,
            rate = self.rate,
            total_requests = self.total_requests,
            seed = ?self.seed,
            request_timeout = ?self.request_timeout,
            ttft_mode = %self.ttft_mode,
            output_json = ?self.output_json,
            config_path = ?self.config_path,
            dry_run = self.dry_run,
            "llm-stress configuration"
        );
    }
}

fn merge(cli: &CliArgs, file_cfg: Option<(PathBuf, FileConfig)>) -> Result<RunConfig, ConfigError> {
    let (cfg_path, file_cfg) = file_cfg.unzip();
    let file_cfg = file_cfg.unwrap_or_default();

    let kind = pick(cli.backend, file_cfg.backend, BackendKind::default());
    let endpoint_raw = pick(
        cli.endpoint.clone(),
        file_cfg.endpoint,
        kind.default_endpoint().to_string(),
    );
    let endpoint = Url::parse(&endpoint_raw).map_err(|source| ConfigError::InvalidEndpoint {
        url: endpoint_raw.clone(),
        source,
    })?;
    let model = pick(cli.model.clone(), file_cfg.model, DEFAULT_MODEL.to_string());
    let system_prompt = pick(
        cli.system_prompt.clone(),
        file_cfg.system_prompt,
        DEFAULT_SYSTEM_PROMPT.to_string(),
    );
    let max_tokens = pick(cli.max_tokens, file_cfg.max_tokens, DEFAULT_MAX_TOKENS);
    let api_key = cli.api_key.clone().or(file_cfg.api_key);

    let cli_queries = collect_queries(&cli.queries, cli.queries_file.as_deref())?;
    let queries = if !cli_queries.is_empty() {
        cli_queries
    } else {
        let file_queries = collect_queries(
            file_cfg.queries.as_deref().unwrap_or_default(),
            file_cfg.queries_file.as_deref(),
        )?;
        if file_queries.is_empty() {
            vec![DEFAULT_QUERY.to_string()]
        } else {
            file_queries
        }
    };

    let concurrency = pick(cli.concurrency, file_cfg.concurrency, DEFAULT_CONCURRENCY);
    let rate = pick(cli.rate, file_cfg.rate, DEFAULT_RATE);
    let total_requests = pick(
        cli.total_requests,
        file_cfg.total_requests,
        DEFAULT_TOTAL_REQUESTS,
    );
    let request_timeout = pick(
        cli.request_timeout,
        file_cfg.request_timeout.map(Into::into),
        DEFAULT_REQUEST_TIMEOUT,
    );
    let request_timeout = if request_timeout.is_zero() {
        None
    } else {
        Some(request_timeout)
    };

    Ok(RunConfig {
        backend: BackendConfig {
            kind,
            endpoint,
            model,
            system_prompt: Some(system_prompt).filter(|prompt| !prompt.is_empty()),
            max_tokens,
            api_key,
        },
        queries,
        concurrency,
        rate,
        total_requests,
        seed: cli.seed.or(file_cfg.seed),
        request_timeout,
        ttft_mode: pick(cli.ttft_mode, file_cfg.ttft_mode, TtftMode::default()),
        output_json: cli.output_json.clone().or(file_cfg.output_json),
        dry_run: cli.dry_run,
        config_path: cfg_path,
    })
}

fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

/// Inline queries first, then the non-blank lines of `file`, trimmed.
fn collect_queries(inline: &[String], file: Option<&Path>) -> Result<Vec<String>, ConfigError> {
    let mut queries: Vec<String> = inline
        .iter()
        .map(|query| query.trim())
        .filter(|query| !query.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(path) = file {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        queries.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    Ok(queries)
}

fn load_file_config(path: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>, ConfigError> {
    if let Some(path) = path {
        return read_config(path).map(|cfg| Some((path.to_path_buf(), cfg)));
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return read_config(&default_path).map(|cfg| Some((default_path, cfg)));
    }

    Ok(None)
}

fn read_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
