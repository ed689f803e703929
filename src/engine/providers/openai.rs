// GraphBot Engine — OpenAI-Compatible Provider
// Speaks /chat/completions against OpenAI, Ollama, OpenRouter, and any
// custom base URL. The retry helpers at the bottom are shared with the
// Anthropic backend.

use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use zeroize::Zeroizing;

use crate::atoms::constants::DEFAULT_LLM_TIMEOUT_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{parse_json_block, LlmProvider};
use crate::atoms::types::*;

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    /// API key wrapped in Zeroizing<> — zeroed from RAM on drop.
    api_key: Zeroizing<String>,
    kind: ProviderKind,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.kind.default_base_url().to_string());
        OpenAiProvider {
            client: Client::builder()
                .timeout(Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: Zeroizing::new(config.api_key.clone()),
            kind: config.kind,
        }
    }

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut obj = json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                });
                if let Some(tool_calls) = &m.tool_calls {
                    obj["tool_calls"] = json!(tool_calls
                        .iter()
                        .map(|tc| json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                "arguments": tc.function.arguments,
                            }
                        }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                if let Some(name) = &m.name {
                    obj["name"] = json!(name);
                }
                // Opaque reasoning round trip for thinking models.
                if let Some(reasoning) = &m.reasoning {
                    obj["reasoning_content"] = reasoning.clone();
                }
                obj
            })
            .collect()
    }

    fn parse_response(&self, body: &Value) -> EngineResult<ChatOutcome> {
        let choice = body["choices"]
            .get(0)
            .ok_or_else(|| EngineError::provider("openai", "response has no choices"))?;
        let msg = &choice["message"];

        let tool_calls: Option<Vec<ToolCall>> = msg["tool_calls"].as_array().map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, tc)| ToolCall {
                    id: tc["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", i)),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                        arguments: tc["function"]["arguments"]
                            .as_str()
                            .unwrap_or("{}")
                            .to_string(),
                    },
                })
                .collect()
        });

        let usage = TokenUsage {
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatOutcome {
            message: Message {
                role: Role::Assistant,
                content: msg["content"].as_str().unwrap_or_default().to_string(),
                tool_calls: tool_calls.filter(|tc| !tc.is_empty()),
                tool_call_id: None,
                name: None,
                reasoning: msg.get("reasoning_content").cloned().filter(|v| !v.is_null()),
            },
            usage,
        })
    }

    async fn post_chat(&self, payload: &Value) -> EngineResult<Value> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(&url)
                .bearer_auth(self.api_key.as_str())
                .json(payload)
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            if attempt <= MAX_RETRIES && is_retryable_status(status.as_u16()) {
                let delay = retry_after.unwrap_or_else(|| retry_delay(attempt));
                warn!(
                    "[provider] {} {} — retry {}/{} in {:?}",
                    url, status, attempt, MAX_RETRIES, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(EngineError::provider(
                "openai",
                format!("API error {}: {}", status, truncate(&body, 300)),
            ));
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        reasoning_effort: Option<&str>,
    ) -> EngineResult<ChatOutcome> {
        let mut payload = json!({
            "model": model,
            "messages": Self::format_messages(messages),
        });
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
        }
        if let Some(t) = temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(effort) = reasoning_effort {
            payload["reasoning_effort"] = json!(effort);
        }

        let body = self.post_chat(&payload).await?;
        let outcome = self.parse_response(&body)?;
        info!(
            "[provider] {} chat: {} in / {} out tokens",
            model, outcome.usage.input_tokens, outcome.usage.output_tokens
        );
        Ok(outcome)
    }

    async fn chat_structured(
        &self,
        messages: &[Message],
        schema: &Value,
        model: &str,
    ) -> EngineResult<Value> {
        let payload = json!({
            "model": model,
            "messages": Self::format_messages(messages),
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "schema": schema,
                    "strict": true,
                }
            }
        });
        let body = self.post_chat(&payload).await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::provider("openai", "structured response had no content"))?;
        parse_json_block(content)
            .ok_or_else(|| EngineError::provider("openai", "structured response was not JSON"))
    }
}

// ── Retry helpers (shared with the Anthropic backend) ──────────────────────

pub const MAX_RETRIES: u32 = 3;

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 529)
}

pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)))
}

pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
