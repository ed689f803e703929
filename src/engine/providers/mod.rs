// GraphBot Engine — LLM Provider Registry
// AnyProvider wraps Arc<dyn LlmProvider> so adding a new backend never
// requires modifying a factory enum — implement the trait and add one arm.

pub mod anthropic;
pub mod mock;
pub mod openai;

use std::sync::Arc;

pub use anthropic::AnthropicProvider;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;

use crate::atoms::error::EngineResult;
use crate::atoms::traits::LlmProvider;
use crate::atoms::types::{
    ChatOutcome, ExtractedFacts, Message, ProviderConfig, ProviderKind, ToolDefinition,
};

/// Type-erased LLM provider. Callers hold `AnyProvider` and never know which
/// concrete backend is in use.
#[derive(Clone)]
pub struct AnyProvider(Arc<dyn LlmProvider>);

impl AnyProvider {
    /// Construct the right concrete provider from a `ProviderConfig`.
    /// Anthropic has a unique wire format; every other kind speaks the
    /// OpenAI-compatible dialect against its own base URL.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let provider: Arc<dyn LlmProvider> = match config.kind {
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)),
            ProviderKind::Mock => Arc::new(MockProvider::echo()),
            _ => Arc::new(OpenAiProvider::new(config)),
        };
        AnyProvider(provider)
    }

    /// Wrap an already-built backend (tests, custom hosts).
    pub fn from_provider(provider: Arc<dyn LlmProvider>) -> Self {
        AnyProvider(provider)
    }

    pub fn kind(&self) -> ProviderKind {
        self.0.kind()
    }

    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        reasoning_effort: Option<&str>,
    ) -> EngineResult<ChatOutcome> {
        self.0.chat(messages, tools, model, temperature, reasoning_effort).await
    }

    pub async fn chat_structured(
        &self,
        messages: &[Message],
        schema: &serde_json::Value,
        model: &str,
    ) -> EngineResult<serde_json::Value> {
        self.0.chat_structured(messages, schema, model).await
    }

    pub async fn summarize(&self, messages: &[Message], model: &str) -> String {
        self.0.summarize(messages, model).await
    }

    pub async fn extract_facts(&self, messages: &[Message], model: &str) -> ExtractedFacts {
        self.0.extract_facts(messages, model).await
    }
}
