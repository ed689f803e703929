// GraphBot Engine — Agent Graph
// The turn state machine, explicit so the iteration bound, tool ordering,
// and cancellation points stay visible:
//
//   load_context ──→ reason ──(tool calls)──→ execute_tools
//                      ↑  └──(no calls / limit)──→ respond
//                      └──────────────────────────────┘
//
// Compiled once at startup with the full tool set; per-turn RBAC filtering
// decides what the model sees, and execute_tools re-checks every call —
// a violation produces a synthetic "permission denied" tool result without
// executing anything.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::{info, warn};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{Message, TokenUsage, UserRole};
use crate::engine::context::ContextBuilder;
use crate::engine::providers::AnyProvider;
use crate::engine::tools::{execute_tool, ToolContext, ToolRegistry};

/// Consecutive identical tool-call rounds before the loop breaker trips.
const MAX_REPEATED_SIGNATURES: usize = 3;

/// Request-scoped state for one turn. Nothing here outlives the turn; the
/// store is the only cross-turn synchronizer.
pub struct AgentState {
    pub user_id: String,
    pub session_id: String,
    pub channel: String,
    pub role: UserRole,
    pub allowed_tools: HashSet<String>,
    pub allowed_layers: HashSet<String>,
    pub skip_context: bool,
    pub iteration: u32,
    /// Full conversation: system + history prefix + this turn's traffic.
    pub messages: Vec<Message>,
    /// Messages produced this turn, in order, for persistence by the runner.
    pub new_messages: Vec<Message>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    LoadContext,
    Reason,
    ExecuteTools,
    Respond,
}

pub struct AgentGraph {
    provider: AnyProvider,
    registry: Arc<ToolRegistry>,
    context: Arc<ContextBuilder>,
    model: String,
    iteration_limit: u32,
}

impl AgentGraph {
    pub fn new(
        provider: AnyProvider,
        registry: Arc<ToolRegistry>,
        context: Arc<ContextBuilder>,
        model: &str,
        iteration_limit: u32,
    ) -> Self {
        AgentGraph { provider, registry, context, model: model.to_string(), iteration_limit }
    }

    /// Drive the state machine to completion. Returns the final assistant
    /// text; everything produced along the way is in `state.new_messages`.
    pub async fn run(&self, state: &mut AgentState, tool_ctx: &ToolContext) -> EngineResult<String> {
        let mut node = Node::LoadContext;
        let mut round_signatures: Vec<u64> = Vec::new();
        let mut redirected = false;

        loop {
            node = match node {
                Node::LoadContext => self.load_context(state)?,
                Node::Reason => {
                    self.reason(state, &mut round_signatures, &mut redirected).await?
                }
                Node::ExecuteTools => self.execute_tools(state, tool_ctx).await?,
                Node::Respond => break,
            };
        }

        Ok(state
            .new_messages
            .iter()
            .rev()
            .find(|m| m.role == crate::atoms::types::Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }

    // ── Nodes ──────────────────────────────────────────────────────────

    fn load_context(&self, state: &mut AgentState) -> EngineResult<Node> {
        let layers: HashSet<String> = if state.skip_context {
            ["identity"].iter().map(|s| s.to_string()).collect()
        } else {
            state.allowed_layers.clone()
        };

        let built = self.context.build(&state.user_id, &state.channel, &self.model, &layers)?;
        if !built.rendered_event_ids.is_empty() {
            mark_rendered_delivered(&self.context, &built.rendered_event_ids);
        }
        state.messages.insert(0, Message::system(built.system_prompt));
        Ok(Node::Reason)
    }

    async fn reason(
        &self,
        state: &mut AgentState,
        round_signatures: &mut Vec<u64>,
        redirected: &mut bool,
    ) -> EngineResult<Node> {
        let defs = self.registry.definitions(&state.allowed_tools);
        state.iteration += 1;
        info!(
            "[graph] Reason round {}/{} session={}",
            state.iteration, self.iteration_limit, state.session_id
        );

        let outcome = match self
            .provider
            .chat(&state.messages, &defs, &self.model, None, None)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                // Chat failures are surfaced to the user, not swallowed.
                warn!("[graph] Provider error: {}", e);
                let synthetic = Message::assistant(format!("(model error: {e})"));
                state.messages.push(synthetic.clone());
                state.new_messages.push(synthetic);
                return Ok(Node::Respond);
            }
        };

        state.usage.add(&outcome.usage);
        let message = outcome.message;
        let has_calls = message.has_tool_calls();
        state.messages.push(message.clone());
        state.new_messages.push(message);

        if !has_calls {
            return Ok(Node::Respond);
        }

        if state.iteration >= self.iteration_limit {
            warn!("[graph] Iteration limit {} reached, forcing respond", self.iteration_limit);
            return Ok(Node::Respond);
        }

        // Loop breaker: the same tool+arguments signature repeating
        // MAX_REPEATED_SIGNATURES rounds means the model is stuck.
        let signature = tool_signature(state.messages.last());
        round_signatures.push(signature);
        let n = round_signatures.len();
        if n >= MAX_REPEATED_SIGNATURES
            && round_signatures[n - MAX_REPEATED_SIGNATURES..].iter().all(|&s| s == signature)
        {
            state.messages.pop();
            state.new_messages.pop();
            if *redirected {
                warn!("[graph] Model ignored loop redirect — hard-breaking turn");
                let fallback = Message::assistant(
                    "I was stuck calling the same tools repeatedly and couldn't make \
                     progress. Please try rephrasing your request.",
                );
                state.messages.push(fallback.clone());
                state.new_messages.push(fallback);
                return Ok(Node::Respond);
            }
            *redirected = true;
            warn!("[graph] Tool-call loop detected — injecting redirect");
            state.messages.push(Message::system(
                "You are repeating the same tool calls with the same arguments. STOP \
                 calling tools and answer the user directly with what you have.",
            ));
            return Ok(Node::Reason);
        }

        Ok(Node::ExecuteTools)
    }

    async fn execute_tools(
        &self,
        state: &mut AgentState,
        tool_ctx: &ToolContext,
    ) -> EngineResult<Node> {
        let calls = state
            .messages
            .last()
            .and_then(|m| m.tool_calls.clone())
            .unwrap_or_default();

        for call in &calls {
            let name = &call.function.name;

            // Second guard layer: the model only saw allowed tools, but a
            // hallucinated name must still bounce here.
            if !state.allowed_tools.contains(name) {
                warn!(
                    "[graph] Permission denied: {} for role {}",
                    name,
                    state.role.as_str()
                );
                let denial = Message::tool_result(&call.id, name, "permission denied");
                state.messages.push(denial.clone());
                state.new_messages.push(denial);
                continue;
            }

            let output = execute_tool(&self.registry, call, tool_ctx).await;
            let result = Message::tool_result(&call.id, name, output.output);
            state.messages.push(result.clone());
            state.new_messages.push(result);
        }

        Ok(Node::Reason)
    }
}

fn tool_signature(message: Option<&Message>) -> u64 {
    let mut parts: Vec<(&str, &str)> = message
        .and_then(|m| m.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|c| (c.function.name.as_str(), c.function.arguments.as_str()))
                .collect()
        })
        .unwrap_or_default();
    parts.sort();
    let mut hasher = DefaultHasher::new();
    for (name, args) in &parts {
        name.hash(&mut hasher);
        args.hash(&mut hasher);
    }
    hasher.finish()
}

/// Mark rendered events delivered through the builder's store handle.
fn mark_rendered_delivered(context: &ContextBuilder, event_ids: &[i64]) {
    if let Err(e) = context.mark_events_delivered(event_ids) {
        warn!("[graph] Failed to mark events delivered: {}", e);
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

    struct Fixture {
        graph: AgentGraph,
        ctx: ToolContext,
        store: Arc<Store>,
    }

    fn fixture(scripts: Vec<Script>, iteration_limit: u32) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.get_or_create_user("alice", None).unwrap();
        let config = Arc::new(Config::default());
        let channels = Arc::new(ChannelRegistry::new(store.clone(), "[gbot] "));
        let registry = Arc::new(echo_registry());
        let context = Arc::new(ContextBuilder::new(store.clone()).with_identity("bot", None));
        let provider = AnyProvider::from_provider(Arc::new(MockProvider::new(scripts)));
        let graph = AgentGraph::new(provider, registry, context, "mock-model", iteration_limit);
        let ctx =
            ToolContext::background(store.clone(), channels, config, "alice", "telegram");
        Fixture { graph, ctx, store }
    }

    fn state(allowed_tools: &[&str]) -> AgentState {
        AgentState {
            user_id: "alice".into(),
            session_id: "s1".into(),
            channel: "telegram".into(),
            role: UserRole::Member,
            allowed_tools: allowed_tools.iter().map(|s| s.to_string()).collect(),
            allowed_layers: crate::engine::permissions::ALL_LAYERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip_context: false,
            iteration: 0,
            messages: vec![Message::user("hi")],
            new_messages: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    fn tool_call_script(name: &str, args: serde_json::Value) -> Script {
        Script::ToolCalls(vec![(name.to_string(), args)], String::new())
    }

    #[tokio::test]
    async fn plain_reply_ends_after_one_round() {
        let f = fixture(vec![Script::Text("hello!".into())], 8);
        let mut st = state(&["echo_web"]);
        let reply = f.graph.run(&mut st, &f.ctx).await.unwrap();
        assert_eq!(reply, "hello!");
        assert_eq!(st.new_messages.len(), 1);
        assert!(st.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn tool_round_trip_in_order() {
        let f = fixture(
            vec![
                tool_call_script("echo_web", serde_json::json!({"q": "gold"})),
                Script::Text("done".into()),
            ],
            8,
        );
        let mut st = state(&["echo_web"]);
        let reply = f.graph.run(&mut st, &f.ctx).await.unwrap();
        assert_eq!(reply, "done");
        // assistant(with calls) → tool → assistant(final)
        let roles: Vec<&str> =
            st.new_messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["assistant", "tool", "assistant"]);
        assert!(st.new_messages[1].content.contains("gold"));
    }

    #[tokio::test]
    async fn permission_violation_yields_synthetic_denial() {
        let f = fixture(
            vec![
                tool_call_script("echo_filesystem", serde_json::json!({"path": "/etc/passwd"})),
                Script::Text("okay, I can't do that".into()),
            ],
            8,
        );
        // echo_filesystem exists in the registry but is not allowed.
        let mut st = state(&["echo_web"]);
        f.graph.run(&mut st, &f.ctx).await.unwrap();
        let tool_msg = &st.new_messages[1];
        assert_eq!(tool_msg.role.as_str(), "tool");
        assert_eq!(tool_msg.content, "permission denied");
    }

    #[tokio::test]
    async fn iteration_limit_forces_respond() {
        // The model always wants to call a tool with fresh args; limit is 3.
        let scripts: Vec<Script> = (0..10)
            .map(|i| tool_call_script("echo_web", serde_json::json!({"round": i})))
            .collect();
        let f = fixture(scripts, 3);
        let mut st = state(&["echo_web"]);
        f.graph.run(&mut st, &f.ctx).await.unwrap();
        // ≤ iteration_limit LLM calls; the limit round keeps its message but
        // executes nothing further.
        assert!(st.iteration <= 3);
        let tool_results =
            st.new_messages.iter().filter(|m| m.role.as_str() == "tool").count();
        assert_eq!(tool_results, 2);
    }

    #[tokio::test]
    async fn provider_error_becomes_synthetic_assistant_message() {
        let f = fixture(vec![Script::Error("quota exhausted".into())], 8);
        let mut st = state(&["echo_web"]);
        let reply = f.graph.run(&mut st, &f.ctx).await.unwrap();
        assert!(reply.starts_with("(model error:"));
        assert!(reply.contains("quota exhausted"));
    }

    #[tokio::test]
    async fn repeated_signature_breaks_loop() {
        // Identical calls every round; the redirect fires at round 3, the
        // hard break at the next repetition window.
        let scripts: Vec<Script> = (0..10)
            .map(|_| tool_call_script("echo_web", serde_json::json!({"q": "same"})))
            .collect();
        let f = fixture(scripts, 20);
        let mut st = state(&["echo_web"]);
        let reply = f.graph.run(&mut st, &f.ctx).await.unwrap();
        assert!(reply.contains("stuck"));
        assert!(st.iteration < 20);
    }

    #[tokio::test]
    async fn load_context_marks_events_delivered() {
        let f = fixture(vec![Script::Text("ok".into())], 8);
        f.store
            .enqueue_event("alice", "subagent_result", &serde_json::json!({"text": "done"}))
            .unwrap();
        let mut st = state(&["echo_web"]);
        f.graph.run(&mut st, &f.ctx).await.unwrap();
        assert!(f.store.undelivered_events("alice").unwrap().is_empty());
        // The rendered event made it into the system prompt.
        assert!(st.messages[0].content.contains("done"));
    }

    #[tokio::test]
    async fn skip_context_is_identity_only() {
        let f = fixture(vec![Script::Text("ok".into())], 8);
        f.store
            .enqueue_event("alice", "subagent_result", &serde_json::json!({"text": "later"}))
            .unwrap();
        let mut st = state(&["echo_web"]);
        st.skip_context = true;
        f.graph.run(&mut st, &f.ctx).await.unwrap();
        assert!(!st.messages[0].content.contains("later"));
        // Unrendered events stay queued.
        assert_eq!(f.store.undelivered_events("alice").unwrap().len(), 1);
    }
}
