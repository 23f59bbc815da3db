// Numan Thabit 2025
//! Wire adapters for the supported inference server flavours.
//!
//! A [`Backend`] owns everything protocol-specific: how a query becomes an HTTP request, which
//! event payload ends the stream, and which payloads carry generated text. The executor and the
//! stream parser only go through this trait.

use std::fmt;
use std::sync::Arc;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

pub mod chat;
pub mod generate;

pub use chat::ChatCompletions;
pub use generate::GenerateStream;

pub const DEFAULT_CHAT_ENDPOINT: &str = "http://localhost:8000/v1/chat/completions";
pub const DEFAULT_GENERATE_ENDPOINT: &str = "http://127.0.0.1:9001/generate_stream";
pub const DEFAULT_MODEL: &str = "Qwen";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Qwen, created by Alibaba Cloud. You are a helpful assistant.";
pub const DEFAULT_MAX_TOKENS: u32 = 16;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// OpenAI-compatible `/v1/chat/completions` streaming.
    #[default]
    Chat,
    /// `/generate_stream` with `inputs` + `parameters`.
    Generate,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Chat => "chat",
            BackendKind::Generate => "generate",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            BackendKind::Chat => DEFAULT_CHAT_ENDPOINT,
            BackendKind::Generate => DEFAULT_GENERATE_ENDPOINT,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved adapter settings. Generation settings are fixed for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub endpoint: Url,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub api_key: Option<String>,
}

impl BackendConfig {
    /// Settings for `kind` with every default applied.
    pub fn with_defaults(kind: BackendKind) -> Self {
        Self {
            kind,
            endpoint: Url::parse(kind.default_endpoint()).expect("valid default endpoint"),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: DEFAULT_MAX_TOKENS,
            api_key: None,
        }
    }
}

pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn endpoint(&self) -> &Url;

    /// Encode `query` into a ready-to-send request.
    fn request(&self, client: &Client, query: &str) -> RequestBuilder;

    /// Raw event data that ends the stream before any structured decoding.
    fn is_sentinel(&self, _data: &str) -> bool {
        false
    }

    /// Decoded payload that is the last one of the stream.
    fn is_terminal(&self, payload: &Map<String, Value>) -> bool;

    /// Decoded payload that carries generated text (as opposed to role or control deltas).
    fn has_content(&self, payload: &Map<String, Value>) -> bool;
}

pub fn build_backend(config: &BackendConfig) -> Arc<dyn Backend> {
    match config.kind {
        BackendKind::Chat => Arc::new(ChatCompletions::new(config)),
        BackendKind::Generate => Arc::new(GenerateStream::new(config)),
    }
}

/// JSON truthiness: `false`, `null`, `0`, `""`, `[]` and `{}` are falsy.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
