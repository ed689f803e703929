// GraphBot Engine — LightAgent
// Minimal isolated agent for background work: its own prompt, its own tool
// subset, its own model. No history, no context layers, no session — and it
// never touches the main conversation. Anything user-visible it produces
// must go out through a messaging tool; that contract is what keeps
// scheduled deliveries at-most-once.

use std::sync::Arc;

use log::info;

use crate::atoms::constants::LIGHT_AGENT_ITERATION_LIMIT;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Message, TokenUsage, ToolDefinition};
use crate::engine::providers::AnyProvider;
use crate::engine::tools::{execute_tool, ToolContext, ToolRegistry};

pub struct LightAgentRun {
    pub text: String,
    pub tokens_used: TokenUsage,
    pub tools_called: Vec<String>,
}

pub struct LightAgent {
    provider: AnyProvider,
    registry: Arc<ToolRegistry>,
    system_prompt: String,
    tool_defs: Vec<ToolDefinition>,
    model: String,
}

impl LightAgent {
    pub fn new(
        provider: AnyProvider,
        registry: Arc<ToolRegistry>,
        system_prompt: &str,
        tool_defs: Vec<ToolDefinition>,
        model: &str,
    ) -> Self {
        LightAgent {
            provider,
            registry,
            system_prompt: system_prompt.to_string(),
            tool_defs,
            model: model.to_string(),
        }
    }

    /// One isolated reason ⇄ execute loop, bounded. Terminates on the first
    /// assistant message without tool calls.
    pub async fn run(&self, user_message: &str, ctx: &ToolContext) -> EngineResult<LightAgentRun> {
        let mut messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(user_message),
        ];
        let mut usage = TokenUsage::default();
        let mut tools_called: Vec<String> = Vec::new();

        for iteration in 0..LIGHT_AGENT_ITERATION_LIMIT {
            let outcome = self
                .provider
                .chat(&messages, &self.tool_defs, &self.model, None, None)
                .await?;
            usage.add(&outcome.usage);
            let message = outcome.message;
            let calls = message.tool_calls.clone().unwrap_or_default();
            messages.push(message);

            if calls.is_empty() {
                let text = messages.last().map(|m| m.content.clone()).unwrap_or_default();
                return Ok(LightAgentRun { text, tokens_used: usage, tools_called });
            }

            info!(
                "[light-agent] round {}: {} tool call(s)",
                iteration + 1,
                calls.len()
            );
            for call in &calls {
                tools_called.push(call.function.name.clone());
                let output = execute_tool(&self.registry, call, ctx).await;
                messages.push(Message::tool_result(&call.id, &call.function.name, output.output));
            }
        }

        // Bound hit with tool calls still pending — return whatever text the
        // last assistant message carried.
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::atoms::types::Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(LightAgentRun { text, tokens_used: usage, tools_called })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::channels::ChannelRegistry;
    use crate::engine::config::Config;
    use crate::engine::providers::mock::{MockProvider, Script};
    use crate::engine::store::Store;
    use crate::engine::tools::testing::echo_registry;

    fn ctx() -> ToolContext {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = Arc::new(Config::default());
        let channels = Arc::new(ChannelRegistry::new(store.clone(), "[gbot] "));
        ToolContext::background(store, channels, config, "alice", "whatsapp")
    }

    fn agent(scripts: Vec<Script>, tools: &[&str]) -> LightAgent {
        let registry = Arc::new(echo_registry());
        let tool_defs = tools
            .iter()
            .filter_map(|name| registry.find(name))
            .map(|s| s.definition())
            .collect();
        LightAgent::new(
            AnyProvider::from_provider(Arc::new(MockProvider::new(scripts))),
            registry,
            "You check the weather.",
            tool_defs,
            "mock-model",
        )
    }

    #[tokio::test]
    async fn terminates_on_first_plain_reply() {
        let a = agent(vec![Script::Text("[SKIP]".into())], &["echo_web"]);
        let run = a.run("check gold price", &ctx()).await.unwrap();
        assert_eq!(run.text, "[SKIP]");
        assert!(run.tools_called.is_empty());
    }

    #[tokio::test]
    async fn tool_loop_records_calls() {
        let a = agent(
            vec![
                Script::ToolCalls(
                    vec![("echo_web".into(), serde_json::json!({"q": "hava"}))],
                    String::new(),
                ),
                Script::Text("sunny, 24°C".into()),
            ],
            &["echo_web"],
        );
        let run = a.run("hava durumu", &ctx()).await.unwrap();
        assert_eq!(run.text, "sunny, 24°C");
        assert_eq!(run.tools_called, vec!["echo_web"]);
        assert!(run.tokens_used.total_tokens > 0);
    }

    #[tokio::test]
    async fn iteration_bound_holds() {
        let scripts: Vec<Script> = (0..10)
            .map(|i| {
                Script::ToolCalls(
                    vec![("echo_web".into(), serde_json::json!({"i": i}))],
                    String::new(),
                )
            })
            .collect();
        let a = agent(scripts, &["echo_web"]);
        let run = a.run("loop forever", &ctx()).await.unwrap();
        assert_eq!(run.tools_called.len(), LIGHT_AGENT_ITERATION_LIMIT as usize);
    }
}
