//! Anthropic Messages API client with tool use.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse,
};
use crate::llm::retry::{RetryPolicy, is_retryable};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Used when the request does not set `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Default API root.
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";

/// `LlmProvider` speaking the Anthropic Messages API.
pub struct AnthropicProvider {
    http: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key,
            model: model.into(),
            base_url: DEFAULT_ANTHROPIC_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_body(&self, request: &ToolCompletionRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .filter_map(|m| m.content.as_deref())
            .collect();

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": convert_messages(&request.messages),
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    async fn post_with_retry(&self, body: &Value) -> Result<MessagesResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut attempt = 0;

        loop {
            let response = self
                .http
                .post(&url)
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", API_VERSION)
                .json(body)
                .send()
                .await
                .map_err(|e| LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if status.is_success() {
                return response.json().await.map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                });
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();

            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return Err(LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                });
            }

            if is_retryable(status) && attempt < self.retry.max_retries {
                let delay = self.retry.delay_for(attempt, retry_after);
                warn!(
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Anthropic request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                });
            }
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }
    }
}

/// Map chat messages onto Anthropic's user/assistant turns. Consecutive tool
/// results are folded into one user turn of `tool_result` blocks.
fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => out.push(json!({
                "role": "user",
                "content": message.content.clone().unwrap_or_default(),
            })),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content.clone().unwrap_or_default(),
                    "is_error": message.is_error,
                });
                let appended = out.last_mut().is_some_and(|last| {
                    let is_result_turn = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .and_then(|blocks| blocks.first())
                            .is_some_and(|b| b["type"] == "tool_result");
                    if is_result_turn && let Some(blocks) = last["content"].as_array_mut() {
                        blocks.push(block.clone());
                        return true;
                    }
                    false
                });
                if !appended {
                    out.push(json!({ "role": "user", "content": [block] }));
                }
            }
        }
    }
    out
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let body = self.request_body(&request);
        let response = self.post_with_retry(&body).await?;

        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text: t } => text.push(t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::Other => {}
            }
        }

        let finish_reason = match response.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolUse,
            _ => FinishReason::Unknown,
        };
        let usage = response.usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: 0,
        });
        debug!(
            model = %self.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            tool_calls = tool_calls.len(),
            "Anthropic completion"
        );

        Ok(ToolCompletionResponse {
            content: if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            },
            tool_calls,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            finish_reason,
        })
    }
}
