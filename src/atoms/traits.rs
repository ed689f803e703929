// ── GraphBot Atoms: Port Traits ────────────────────────────────────────────
// The outbound interfaces the engine depends on. Concrete backends live in
// engine/providers (LLM) and host code (channel adapters); tests install
// scripted mocks.

use async_trait::async_trait;

use crate::atoms::constants::SUMMARY_FALLBACK;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ChatOutcome, ExtractedFacts, Message, ProviderKind, ToolDefinition};

// ── LLM provider port ──────────────────────────────────────────────────────

/// Unified chat + summarize + extract_facts + structured-output interface.
///
/// `chat` and `chat_structured` propagate failures; `summarize` and
/// `extract_facts` are best-effort and must never fail outward — they return
/// sentinel values instead. The default implementations below express the
/// best-effort pair in terms of `chat`, so a backend only has to implement
/// the two fallible calls.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One model round trip. The returned assistant message may carry tool
    /// calls, and may carry opaque reasoning metadata which callers must echo
    /// back verbatim on the next call.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        reasoning_effort: Option<&str>,
    ) -> EngineResult<ChatOutcome>;

    /// One model round trip constrained to a JSON schema. Returns a
    /// schema-shaped value or fails; callers treat failure as fatal for the
    /// operation that needed the structure.
    async fn chat_structured(
        &self,
        messages: &[Message],
        schema: &serde_json::Value,
        model: &str,
    ) -> EngineResult<serde_json::Value>;

    /// Condense a conversation into a short hybrid summary. Best-effort.
    async fn summarize(&self, messages: &[Message], model: &str) -> String {
        let mut prompt = String::from(
            "Summarize the following conversation in a short paragraph followed \
             by bullet points of concrete facts and decisions. Reply with the \
             summary only.\n\n",
        );
        for m in messages {
            prompt.push_str(m.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
        match self.chat(&[Message::user(prompt)], &[], model, Some(0.2), None).await {
            Ok(outcome) if !outcome.message.content.trim().is_empty() => outcome.message.content,
            _ => SUMMARY_FALLBACK.to_string(),
        }
    }

    /// Pull durable user facts out of a conversation. Best-effort: parse
    /// failures and provider errors yield the empty value.
    async fn extract_facts(&self, messages: &[Message], model: &str) -> ExtractedFacts {
        let mut prompt = String::from(
            "Extract durable user facts from this conversation. Reply with JSON \
             only: {\"preferences\": [{\"key\": str, \"value\": any}], \
             \"notes\": [str]}. Use empty arrays when nothing qualifies.\n\n",
        );
        for m in messages {
            prompt.push_str(m.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
        let reply = match self.chat(&[Message::user(prompt)], &[], model, Some(0.0), None).await {
            Ok(outcome) => outcome.message.content,
            Err(_) => return ExtractedFacts::default(),
        };
        parse_json_block(&reply)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Find the first JSON object in a model reply, tolerating code fences and
/// surrounding prose.
pub fn parse_json_block(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

// ── Channel adapter port ───────────────────────────────────────────────────

/// One concrete transport (Telegram bridge, WhatsApp bridge, websocket…).
/// The engine's channel registry handles identity resolution, the bot-voice
/// prefix, and message splitting; an adapter only moves text to an address.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether outbound messages appear under the owner's own identity
    /// (e.g. a paired WhatsApp session) rather than a dedicated bot account.
    /// Shared-identity transports get the bot-voice prefix.
    fn shared_identity(&self) -> bool {
        false
    }

    /// Platform message size limit; longer texts are split before delivery.
    fn max_message_len(&self) -> usize {
        4000
    }

    async fn deliver(&self, channel_address: &str, text: &str) -> EngineResult<()>;
}

// ── Token counting ─────────────────────────────────────────────────────────

/// Pluggable token counter for context-layer budgets. The session rotation
/// threshold itself uses provider-reported usage; this trait only shapes
/// prompt assembly.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Default counter: the chars/4 heuristic. Good enough for budget-shaping;
/// hosts that need model-exact counts install their own.
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}
