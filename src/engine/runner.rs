// GraphBot Engine — GraphRunner
// The orchestrator and only caller of the agent graph. One process() call is
// one turn: resolve (and maybe rotate) the session, load the history prefix,
// resolve RBAC, run the graph, persist what it produced, account tokens.
//
// Persistence order matters: the user message goes in before the graph runs,
// so a provider or store failure mid-turn leaves a consistent prefix; the
// assistant/tool messages go in after, in production order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;

use crate::atoms::constants::SUMMARY_FALLBACK;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Message, Role, Session, TokenUsage, UserRole};
use crate::engine::channels::ChannelRegistry;
use crate::engine::config::Config;
use crate::engine::context::ContextBuilder;
use crate::engine::delegation::DelegationPlanner;
use crate::engine::graph::{AgentGraph, AgentState};
use crate::engine::permissions::Permissions;
use crate::engine::providers::AnyProvider;
use crate::engine::scheduler::SchedulerHandle;
use crate::engine::store::Store;
use crate::engine::tools::{ToolContext, ToolRegistry};
use crate::engine::worker::SubagentWorker;

/// Sliding one-minute window per user. 0 = unlimited.
struct RateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    fn new(per_minute: u32) -> Self {
        RateLimiter { per_minute, windows: Mutex::new(HashMap::new()) }
    }

    fn check(&self, user_id: &str) -> EngineResult<()> {
        if self.per_minute == 0 {
            return Ok(());
        }
        let mut windows = self.windows.lock();
        let window = windows.entry(user_id.to_string()).or_default();
        if let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(60)) {
            window.retain(|t| *t > cutoff);
        }
        if window.len() >= self.per_minute as usize {
            return Err(EngineError::RateLimited(format!(
                "{} exceeded {} requests/minute",
                user_id, self.per_minute
            )));
        }
        window.push(Instant::now());
        Ok(())
    }
}

pub struct GraphRunner {
    store: Arc<Store>,
    provider: AnyProvider,
    registry: Arc<ToolRegistry>,
    permissions: Arc<Permissions>,
    channels: Arc<ChannelRegistry>,
    config: Arc<Config>,
    graph: AgentGraph,
    rate: RateLimiter,
    scheduler: Option<SchedulerHandle>,
    worker: Option<Arc<SubagentWorker>>,
    planner: Option<Arc<DelegationPlanner>>,
}

impl GraphRunner {
    pub fn new(
        store: Arc<Store>,
        provider: AnyProvider,
        registry: Arc<ToolRegistry>,
        permissions: Arc<Permissions>,
        channels: Arc<ChannelRegistry>,
        context: Arc<ContextBuilder>,
        config: Arc<Config>,
    ) -> Self {
        let graph = AgentGraph::new(
            provider.clone(),
            registry.clone(),
            context,
            &config.assistant.model,
            config.assistant.iteration_limit,
        );
        let rate = RateLimiter::new(config.auth.rate_limit.requests_per_minute);
        GraphRunner {
            store,
            provider,
            registry,
            permissions,
            channels,
            config,
            graph,
            rate,
            scheduler: None,
            worker: None,
            planner: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_worker(mut self, worker: Arc<SubagentWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_planner(mut self, planner: Arc<DelegationPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// One turn. Returns (reply, session_id).
    pub async fn process(
        &self,
        user_id: &str,
        channel: &str,
        text: &str,
        skip_context: bool,
    ) -> EngineResult<(String, String)> {
        // Quota first: a limited caller causes no side effects at all.
        self.rate.check(user_id)?;

        let user = if self.config.assistant.auto_create_users {
            self.store.get_or_create_user(user_id, None)?
        } else {
            self.store
                .get_user(user_id)?
                .ok_or_else(|| EngineError::UserUnknown(user_id.to_string()))?
        };
        let role = user.role;

        let session = self.resolve_session(user_id, channel, role).await?;
        let session_id = session.session_id.clone();

        let history = self
            .store
            .recent_messages(&session_id, self.config.assistant.history_limit)?;
        let mut messages: Vec<Message> =
            history.iter().map(|m| m.to_chat_message()).collect();

        // Persist the user message before the graph runs.
        self.store.append_message(&session_id, "user", text, None)?;
        messages.push(Message::user(text));

        let allowed_tools = self.permissions.allowed_tools(role, &self.registry);
        let allowed_layers = self.permissions.allowed_context_layers(role);

        let mut state = AgentState {
            user_id: user_id.to_string(),
            session_id: session_id.clone(),
            channel: channel.to_string(),
            role,
            allowed_tools,
            allowed_layers,
            skip_context,
            iteration: 0,
            messages,
            new_messages: Vec::new(),
            usage: TokenUsage::default(),
        };

        let tool_ctx = ToolContext {
            store: self.store.clone(),
            channels: self.channels.clone(),
            config: self.config.clone(),
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            session_id: Some(session_id.clone()),
            scheduler: self.scheduler.clone(),
            worker: self.worker.clone(),
            planner: self.planner.clone(),
        };

        let reply = self.graph.run(&mut state, &tool_ctx).await?;

        // Persist everything the graph produced, in order.
        for message in &state.new_messages {
            self.store.append_message_row(
                &session_id,
                message.role.as_str(),
                &message.content,
                message.tool_calls.as_deref(),
                message.tool_call_id.as_deref(),
                message.name.as_deref(),
            )?;
        }

        let total = self
            .store
            .add_session_tokens(&session_id, state.usage.total_tokens as i64)?;
        info!(
            "[runner] Turn done session={} tokens={}/{}",
            session_id, total, self.config.assistant.session_token_limit
        );

        Ok((reply, session_id))
    }

    /// Resolve the open session, rotating when the token budget is spent.
    /// Roles capped at one session reuse any open session across channels.
    async fn resolve_session(
        &self,
        user_id: &str,
        channel: &str,
        role: UserRole,
    ) -> EngineResult<Session> {
        let capped_at_one = self.permissions.max_sessions(role) == 1;
        let existing = if capped_at_one {
            self.store.any_open_session(user_id)?
        } else {
            self.store.get_open_session(user_id, channel)?
        };

        match existing {
            Some(session)
                if session.token_count >= self.config.assistant.session_token_limit =>
            {
                self.rotate_session(&session.session_id).await?;
                Ok(self.store.open_session(user_id, channel)?)
            }
            Some(session) => Ok(session),
            None => Ok(self.store.open_session(user_id, channel)?),
        }
    }

    /// Close a session over budget: summarize and extract facts
    /// (best-effort), then close. The close always happens — summarization
    /// failures must not wedge the rotation path.
    pub async fn rotate_session(&self, session_id: &str) -> EngineResult<()> {
        let session = match self.store.get_session(session_id)? {
            Some(s) if s.is_open() => s,
            // Concurrent rotation: someone else already closed it.
            _ => return Ok(()),
        };

        let history = self.store.recent_messages(session_id, 50)?;
        let conversational: Vec<Message> = history
            .iter()
            .map(|m| m.to_chat_message())
            .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
            .collect();

        let model = &self.config.assistant.model;
        let summary = if conversational.is_empty() {
            SUMMARY_FALLBACK.to_string()
        } else {
            self.provider.summarize(&conversational, model).await
        };

        if !conversational.is_empty() {
            let facts = self.provider.extract_facts(&conversational, model).await;
            for pref in &facts.preferences {
                let mut doc = serde_json::Map::new();
                doc.insert(pref.key.clone(), pref.value.clone());
                let doc = serde_json::Value::Object(doc);
                if let Err(e) = self.store.merge_preferences(&session.user_id, &doc) {
                    warn!("[runner] Could not persist preference '{}': {}", pref.key, e);
                }
            }
            for note in &facts.notes {
                if let Err(e) = self.store.add_note(
                    &session.user_id,
                    note,
                    crate::atoms::types::NoteSource::Extraction,
                ) {
                    warn!("[runner] Could not persist note: {}", e);
                }
            }
        }

        let closed = self.store.end_session(session_id, &summary, "token_limit")?;
        if closed {
            info!("[runner] Rotated session {}", session_id);
        }
        Ok(())
    }
}
