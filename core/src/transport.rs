//! Chat-completion transport.
//!
//! The workflow engine only ever sees [`ChatTransport`]: a chat-style
//! endpoint that accepts role-tagged messages and returns text plus
//! whatever usage numbers the provider reports. The reqwest implementation
//! speaks the common `/chat/completions` JSON shape; tests substitute
//! scripted in-process transports.

use std::time::Duration;

use async_trait::async_trait;
use quarry_protocol::ChatMessage;
use quarry_protocol::TokenUsage;
use serde::Deserialize;
use serde::Serialize;

use crate::error::QuarryErr;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub message: ChatMessage,
    /// Provider-reported usage; absent when the provider does not report
    /// any, in which case the caller falls back to its own estimate.
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion>;
}

/// `/chat/completions`-shaped client over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestChatTransport {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    deadline: Duration,
}

impl ReqwestChatTransport {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            deadline,
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[async_trait]
impl ChatTransport for ReqwestChatTransport {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = WireRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_output_tokens,
        };

        let mut builder = self.client.post(&url).timeout(self.deadline).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                QuarryErr::Deadline(self.deadline)
            } else {
                QuarryErr::LlmTransport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QuarryErr::LlmTransport(format!(
                "{status}: {}",
                parse_error_message(&text)
            )));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|err| QuarryErr::LlmTransport(err.to_string()))?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(QuarryErr::LlmMalformedOutput(
                "response contained no choices".to_string(),
            ));
        };

        Ok(ChatCompletion {
            message: choice.message,
            usage: parsed.usage.map(|usage| TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        })
    }
}

fn parse_error_message(text: &str) -> String {
    let json = serde_json::from_str::<serde_json::Value>(text).unwrap_or_default();
    if let Some(message) = json
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(|message| message.as_str())
    {
        return message.to_string();
    }
    if text.is_empty() {
        return "unknown error".to_string();
    }
    text.to_string()
}
