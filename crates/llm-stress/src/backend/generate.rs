// Numan Thabit 2025
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use super::{truthy, Backend, BackendConfig, BackendKind};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
}

#[derive(Debug, Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
    do_sample: bool,
}

/// `/generate_stream` adapter: one event per token, the last one carries `generated_text`.
#[derive(Debug, Clone)]
pub struct GenerateStream {
    endpoint: Url,
    max_new_tokens: u32,
}

impl GenerateStream {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            max_new_tokens: config.max_tokens,
        }
    }
}

impl Backend for GenerateStream {
    fn kind(&self) -> BackendKind {
        BackendKind::Generate
    }

    fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request(&self, client: &Client, query: &str) -> RequestBuilder {
        let body = GenerateRequest {
            inputs: query,
            parameters: GenerateParameters {
                max_new_tokens: self.max_new_tokens,
                do_sample: false,
            },
        };
        client.post(self.endpoint.clone()).json(&body)
    }

    fn is_terminal(&self, payload: &Map<String, Value>) -> bool {
        payload.get("end").is_some_and(truthy) || payload.get("generated_text").is_some_and(truthy)
    }

    fn has_content(&self, payload: &Map<String, Value>) -> bool {
        let token_text = payload.get("token").is_some_and(|token| {
            let special = token.get("special").and_then(Value::as_bool).unwrap_or(false);
            let text = token.get("text").and_then(Value::as_str).unwrap_or("");
            !special && !text.is_empty()
        });
        token_text || payload.get("generated_text").is_some_and(truthy)
    }
}
