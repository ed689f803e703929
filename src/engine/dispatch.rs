// GraphBot Engine — Processor Dispatch
// The one implementation of the three processor semantics, shared by the
// scheduler (triggered work) and the subagent worker (immediate work):
//
//   static   — the dispatcher delivers plan.message through the channel
//              port. The only processor where the dispatcher itself sends.
//   function — the named tool runs once and is the entire side effect.
//   agent    — an isolated LightAgent runs and owns its own delivery via
//              messaging tools; the dispatcher never sends on its behalf.
//              That rule is the sole protection against duplicate messages.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::atoms::constants::{AGENT_PROCESSOR_TIMEOUT_SECS, SKIP_MARKERS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::plan::{ExecutionPlan, NotifyCondition, ProcessorKind};
use crate::atoms::types::{ExecStatus, FunctionCall, ToolCall};
use crate::engine::channels::ChannelRegistry;
use crate::engine::config::Config;
use crate::engine::light_agent::LightAgent;
use crate::engine::providers::AnyProvider;
use crate::engine::store::Store;
use crate::engine::tools::{execute_tool, ToolContext, ToolRegistry};

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: ExecStatus,
    pub detail: Option<String>,
}

pub struct Dispatcher {
    store: Arc<Store>,
    channels: Arc<ChannelRegistry>,
    registry: Arc<ToolRegistry>,
    provider: AnyProvider,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        channels: Arc<ChannelRegistry>,
        registry: Arc<ToolRegistry>,
        provider: AnyProvider,
        config: Arc<Config>,
    ) -> Self {
        Dispatcher { store, channels, registry, provider, config }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Execute one plan for one user on one channel. Errors are the caller's
    /// to log and count; a clean run reports success or skipped.
    pub async fn dispatch(
        &self,
        user_id: &str,
        channel: &str,
        plan: &ExecutionPlan,
    ) -> EngineResult<DispatchOutcome> {
        match plan.processor {
            ProcessorKind::Static => self.run_static(user_id, channel, plan).await,
            ProcessorKind::Function => self.run_function(user_id, channel, plan).await,
            ProcessorKind::Agent => self.run_agent(user_id, channel, plan).await,
        }
    }

    async fn run_static(
        &self,
        user_id: &str,
        channel: &str,
        plan: &ExecutionPlan,
    ) -> EngineResult<DispatchOutcome> {
        let message = plan
            .message
            .as_deref()
            .ok_or_else(|| EngineError::Schedule("static plan has no message".into()))?;
        self.channels.send(user_id, channel, message).await?;
        Ok(DispatchOutcome { status: ExecStatus::Success, detail: Some(message.to_string()) })
    }

    async fn run_function(
        &self,
        user_id: &str,
        channel: &str,
        plan: &ExecutionPlan,
    ) -> EngineResult<DispatchOutcome> {
        let tool_name = plan
            .tool_name
            .as_deref()
            .ok_or_else(|| EngineError::Schedule("function plan has no tool_name".into()))?;

        // Background executions only reach the background-safe tool set.
        if !self.registry.background_tool_names().contains(tool_name) {
            return Err(EngineError::Schedule(format!(
                "tool '{tool_name}' is unknown or not background-safe"
            )));
        }
        match self.registry.find(tool_name) {
            Some(spec) if spec.available => {}
            _ => {
                return Err(EngineError::Schedule(format!("tool '{tool_name}' is unavailable")));
            }
        }

        let args = plan.tool_args.clone().unwrap_or_else(|| serde_json::json!({}));
        let call = ToolCall {
            id: format!("sched_{}", uuid::Uuid::new_v4()),
            call_type: "function".into(),
            function: FunctionCall { name: tool_name.to_string(), arguments: args.to_string() },
        };
        let ctx = ToolContext::background(
            self.store.clone(),
            self.channels.clone(),
            self.config.clone(),
            user_id,
            channel,
        );

        // The tool is the entire side effect — no extra delivery afterwards.
        let output = execute_tool(&self.registry, &call, &ctx).await;
        if output.success {
            Ok(DispatchOutcome { status: ExecStatus::Success, detail: Some(output.output) })
        } else {
            Err(EngineError::Schedule(output.output))
        }
    }

    async fn run_agent(
        &self,
        user_id: &str,
        channel: &str,
        plan: &ExecutionPlan,
    ) -> EngineResult<DispatchOutcome> {
        let base_prompt = plan
            .prompt
            .as_deref()
            .ok_or_else(|| EngineError::Schedule("agent plan has no prompt".into()))?;
        let prompt = format!(
            "{base_prompt}\n\nIMPORTANT: when sending messages, set channel='{channel}'."
        );

        let requested = plan.tools.clone().unwrap_or_default();
        let tool_defs = self.registry.resolve_background_subset(&requested);
        let model = plan
            .model
            .clone()
            .unwrap_or_else(|| self.config.assistant.model.clone());

        let agent =
            LightAgent::new(self.provider.clone(), self.registry.clone(), &prompt, tool_defs, &model);
        let ctx = ToolContext::background(
            self.store.clone(),
            self.channels.clone(),
            self.config.clone(),
            user_id,
            channel,
        );

        let run = tokio::time::timeout(
            Duration::from_secs(AGENT_PROCESSOR_TIMEOUT_SECS),
            agent.run("Execute your task now.", &ctx),
        )
        .await
        .map_err(|_| EngineError::Schedule("agent run timed out".into()))??;

        if plan.notify_condition == NotifyCondition::NotifySkip && is_skip_response(&run.text) {
            info!("[dispatch] Agent signalled skip for {}", user_id);
            return Ok(DispatchOutcome { status: ExecStatus::Skipped, detail: Some(run.text) });
        }

        // The agent already delivered (or chose not to). Nothing to send.
        Ok(DispatchOutcome { status: ExecStatus::Success, detail: Some(run.text) })
    }

    /// Notify the user that a trigger failed, used by callers honoring
    /// notify_condition = always. Best-effort: a dead channel must not turn
    /// a logging path into another error.
    pub async fn notify_failure(&self, user_id: &str, channel: &str, detail: &str) {
        let text = format!("A scheduled task failed: {detail}");
        if let Err(e) = self.channels.send(user_id, channel, &text).await {
            warn!("[dispatch] Could not notify {} about failure: {}", user_id, e);
        }
    }
}

/// Case-insensitive skip-marker match at the response boundary.
pub fn is_skip_response(text: &str) -> bool {
    let trimmed = text.trim().to_uppercase();
    if trimmed.is_empty() {
        return false;
    }
    SKIP_MARKERS.iter().any(|marker| {
        trimmed == *marker || trimmed.starts_with(marker) || trimmed.ends_with(marker)
    })
}
