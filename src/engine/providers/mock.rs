// GraphBot Engine — Scripted Mock Provider
// Deterministic backend for tests: each chat call pops the next scripted
// outcome; structured calls pop from their own queue. Records every request
// so tests can assert on what the engine actually sent.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::LlmProvider;
use crate::atoms::types::*;

/// One recorded chat request: (messages, tool names offered).
pub type SeenRequest = (Vec<Message>, Vec<String>);

pub enum Script {
    /// Plain assistant text.
    Text(String),
    /// Assistant message with tool calls (name, json-args) and optional text.
    ToolCalls(Vec<(String, Value)>, String),
    /// Fail this call with a provider error.
    Error(String),
}

pub struct MockProvider {
    scripts: Mutex<VecDeque<Script>>,
    structured: Mutex<VecDeque<EngineResult<Value>>>,
    /// Reply used once the script queue is exhausted. None = echo the last
    /// user message.
    fallback_text: Option<String>,
    /// Every chat request the engine made, in order.
    pub seen: Mutex<Vec<SeenRequest>>,
    /// Usage attributed to each scripted reply.
    usage_per_call: TokenUsage,
}

impl MockProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        MockProvider {
            scripts: Mutex::new(scripts.into()),
            structured: Mutex::new(VecDeque::new()),
            fallback_text: None,
            seen: Mutex::new(Vec::new()),
            usage_per_call: TokenUsage { input_tokens: 10, output_tokens: 10, total_tokens: 20 },
        }
    }

    /// Echoes the last user message back, forever.
    pub fn echo() -> Self {
        MockProvider::new(Vec::new())
    }

    /// Provider that always returns the same text.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut p = MockProvider::new(Vec::new());
        p.fallback_text = Some(reply.into());
        p
    }

    pub fn with_structured(self, results: Vec<EngineResult<Value>>) -> Self {
        *self.structured.lock() = results.into();
        self
    }

    /// Append structured-output scripts after construction (shared handles).
    pub fn queue_structured(&self, results: Vec<EngineResult<Value>>) {
        self.structured.lock().extend(results);
    }

    pub fn calls_made(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        _model: &str,
        _temperature: Option<f64>,
        _reasoning_effort: Option<&str>,
    ) -> EngineResult<ChatOutcome> {
        self.seen.lock().push((
            messages.to_vec(),
            tools.iter().map(|t| t.function.name.clone()).collect(),
        ));

        let script = self.scripts.lock().pop_front();
        let message = match script {
            None => match &self.fallback_text {
                Some(text) => Message::assistant(text.clone()),
                None => {
                    // Echo fallback keeps unscripted tests simple.
                    let last_user = messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::User)
                        .map(|m| m.content.clone())
                        .unwrap_or_else(|| "[no input]".into());
                    Message::assistant(format!("MOCK: {last_user}"))
                }
            },
            Some(Script::Text(text)) => Message::assistant(text),
            Some(Script::ToolCalls(calls, text)) => Message {
                role: Role::Assistant,
                content: text,
                tool_calls: Some(
                    calls
                        .into_iter()
                        .enumerate()
                        .map(|(i, (name, args))| ToolCall {
                            id: format!("call_{i}"),
                            call_type: "function".into(),
                            function: FunctionCall { name, arguments: args.to_string() },
                        })
                        .collect(),
                ),
                tool_call_id: None,
                name: None,
                reasoning: None,
            },
            Some(Script::Error(msg)) => return Err(EngineError::provider("mock", msg)),
        };

        Ok(ChatOutcome { message, usage: self.usage_per_call.clone() })
    }

    async fn chat_structured(
        &self,
        messages: &[Message],
        _schema: &Value,
        _model: &str,
    ) -> EngineResult<Value> {
        self.seen.lock().push((messages.to_vec(), vec!["<structured>".into()]));
        self.structured
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::provider("mock", "no structured script queued")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripts_pop_in_order() {
        let provider = MockProvider::new(vec![
            Script::Text("one".into()),
            Script::ToolCalls(vec![("t".into(), serde_json::json!({}))], String::new()),
        ]);
        let out = provider.chat(&[Message::user("a")], &[], "m", None, None).await.unwrap();
        assert_eq!(out.message.content, "one");
        let out = provider.chat(&[Message::user("b")], &[], "m", None, None).await.unwrap();
        assert!(out.message.has_tool_calls());
        // Exhausted — echo fallback.
        let out = provider.chat(&[Message::user("c")], &[], "m", None, None).await.unwrap();
        assert_eq!(out.message.content, "MOCK: c");
        assert_eq!(provider.calls_made(), 3);
    }

    #[tokio::test]
    async fn structured_queue_and_default_error() {
        let provider = MockProvider::new(vec![])
            .with_structured(vec![Ok(serde_json::json!({"execution": "immediate"}))]);
        let v = provider
            .chat_structured(&[Message::user("x")], &serde_json::json!({}), "m")
            .await
            .unwrap();
        assert_eq!(v["execution"], "immediate");
        assert!(provider
            .chat_structured(&[Message::user("y")], &serde_json::json!({}), "m")
            .await
            .is_err());
    }
}
