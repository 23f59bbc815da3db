// Numan Thabit 2025
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use super::{Backend, BackendConfig, BackendKind};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// OpenAI-compatible streaming chat completions.
#[derive(Debug, Clone)]
pub struct ChatCompletions {
    endpoint: Url,
    model: String,
    system_prompt: Option<String>,
    max_tokens: u32,
    api_key: Option<String>,
}

impl ChatCompletions {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            system_prompt: config
                .system_prompt
                .clone()
                .filter(|prompt| !prompt.is_empty()),
            max_tokens: config.max_tokens,
            api_key: config.api_key.clone(),
        }
    }
}

impl Backend for ChatCompletions {
    fn kind(&self) -> BackendKind {
        BackendKind::Chat
    }

    fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request(&self, client: &Client, query: &str) -> RequestBuilder {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: query,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            max_tokens: self.max_tokens,
        };
        let builder = client.post(self.endpoint.clone()).json(&body);
        match self.api_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn is_sentinel(&self, data: &str) -> bool {
        data.trim() == DONE_SENTINEL
    }

    // The stream only ends on the sentinel; a chunk with `finish_reason` may still be followed
    // by a usage chunk.
    fn is_terminal(&self, _payload: &Map<String, Value>) -> bool {
        false
    }

    fn has_content(&self, payload: &Map<String, Value>) -> bool {
        let Some(choice) = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return false;
        };
        let delta = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str);
        let text = choice.get("text").and_then(Value::as_str);
        delta.or(text).is_some_and(|content| !content.is_empty())
    }
}
