// GraphBot Engine — Anthropic Claude Provider
// All Claude-specific wire translation lives here: system extraction, tool
// results as user-role tool_result blocks, thinking blocks carried opaque.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde_json::{json, Value};
use zeroize::Zeroizing;

use crate::atoms::constants::DEFAULT_LLM_TIMEOUT_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::LlmProvider;
use crate::atoms::types::*;
use crate::engine::providers::openai::{
    is_retryable_status, parse_retry_after, retry_delay, truncate, MAX_RETRIES,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::Anthropic.default_base_url().to_string());
        AnthropicProvider {
            client: Client::builder()
                .timeout(Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: Zeroizing::new(config.api_key.clone()),
        }
    }

    /// Claude separates the system prompt and uses user-role tool_result
    /// blocks for tool messages. Assistant thinking blocks (if we carried
    /// any) are echoed back verbatim ahead of the text.
    fn format_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut formatted: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    system = Some(msg.content.clone());
                }
                Role::Tool => {
                    if let Some(tc_id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": tc_id,
                                "content": msg.content,
                            }]
                        }));
                    }
                }
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if let Some(reasoning) = &msg.reasoning {
                        // Opaque round trip: whatever block array we captured
                        // goes back exactly as received.
                        if let Some(arr) = reasoning.as_array() {
                            blocks.extend(arr.iter().cloned());
                        }
                    }
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    if let Some(tool_calls) = &msg.tool_calls {
                        for tc in tool_calls {
                            let input: Value = serde_json::from_str(&tc.function.arguments)
                                .unwrap_or_else(|_| json!({}));
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.function.name,
                                "input": input,
                            }));
                        }
                    }
                    formatted.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::User => {
                    formatted.push(json!({"role": "user", "content": msg.content}));
                }
            }
        }
        (system, formatted)
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect()
    }

    fn parse_response(body: &Value) -> ChatOutcome {
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut reasoning_blocks: Vec<Value> = Vec::new();

        if let Some(content) = body["content"].as_array() {
            for block in content {
                match block["type"].as_str().unwrap_or_default() {
                    "text" => text.push_str(block["text"].as_str().unwrap_or_default()),
                    "tool_use" => tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        call_type: "function".into(),
                        function: FunctionCall {
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            arguments: block["input"].to_string(),
                        },
                    }),
                    // thinking / redacted_thinking — carried verbatim for the
                    // next round trip, never parsed.
                    "thinking" | "redacted_thinking" => reasoning_blocks.push(block.clone()),
                    _ => {}
                }
            }
        }

        let usage = TokenUsage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0)
                + body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };

        ChatOutcome {
            message: Message {
                role: Role::Assistant,
                content: text,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
                name: None,
                reasoning: (!reasoning_blocks.is_empty()).then(|| Value::Array(reasoning_blocks)),
            },
            usage,
        }
    }

    async fn post_messages(&self, payload: &Value) -> EngineResult<Value> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(&url)
                .header("x-api-key", self.api_key.as_str())
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                warn!("[provider] anthropic {} — retry {}/{} in {:?}", status, attempt, MAX_RETRIES, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(EngineError::provider(
                "anthropic",
                format!("API error {}: {}", status, truncate(&body, 300)),
            ));
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        reasoning_effort: Option<&str>,
    ) -> EngineResult<ChatOutcome> {
        let (system, formatted) = Self::format_messages(messages);
        let mut payload = json!({
            "model": model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": formatted,
        });
        if let Some(sys) = system {
            payload["system"] = json!(sys);
        }
        if !tools.is_empty() {
            payload["tools"] = json!(Self::format_tools(tools));
        }
        if let Some(t) = temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(effort) = reasoning_effort {
            let budget: u64 = match effort {
                "high" => 16384,
                "medium" => 4096,
                _ => 1024,
            };
            payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }

        let body = self.post_messages(&payload).await?;
        Ok(Self::parse_response(&body))
    }

    /// Structured output via a forced tool call: the schema becomes the
    /// input_schema of a synthetic tool, and tool_choice pins it.
    async fn chat_structured(
        &self,
        messages: &[Message],
        schema: &Value,
        model: &str,
    ) -> EngineResult<Value> {
        let (system, formatted) = Self::format_messages(messages);
        let mut payload = json!({
            "model": model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": formatted,
            "tools": [{
                "name": "emit_structured",
                "description": "Emit the structured result.",
                "input_schema": schema,
            }],
            "tool_choice": {"type": "tool", "name": "emit_structured"},
        });
        if let Some(sys) = system {
            payload["system"] = json!(sys);
        }

        let body = self.post_messages(&payload).await?;
        body["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "tool_use"))
            .map(|b| b["input"].clone())
            .ok_or_else(|| EngineError::provider("anthropic", "no structured tool_use in response"))
    }
}
