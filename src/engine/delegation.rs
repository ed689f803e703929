// GraphBot Engine — Delegation Planner
// One structured-output LLM call: natural language task in, typed
// ExecutionPlan out. The tool-name space is closed — plans referencing
// unknown tools are invalid, caught here rather than at trigger time.

use std::collections::HashSet;
use std::sync::Arc;

use log::info;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::plan::{ExecutionPlan, ProcessorKind};
use crate::atoms::types::Message;
use crate::engine::providers::AnyProvider;
use crate::engine::tools::ToolRegistry;

pub struct DelegationPlanner {
    provider: AnyProvider,
    model: String,
    temperature: f64,
    /// Human-readable tool catalog embedded in the planner prompt.
    catalog: String,
    /// Names a plan may reference (background-safe set).
    known_tools: HashSet<String>,
}

impl DelegationPlanner {
    pub fn new(
        provider: AnyProvider,
        registry: &Arc<ToolRegistry>,
        model: &str,
        temperature: f64,
    ) -> Self {
        DelegationPlanner {
            provider,
            model: model.to_string(),
            temperature,
            catalog: registry.background_catalog_text(),
            known_tools: registry.background_tool_names(),
        }
    }

    fn prompt(&self, task: &str, originating_channel: &str) -> String {
        format!(
            "You translate a background-task request into an execution plan.\n\
             \n\
             Two independent choices:\n\
             - execution (WHEN): immediate | delayed (needs delay_seconds) | \
             recurring (needs cron_expr) | monitor (needs cron_expr, implies \
             notify_condition=notify_skip)\n\
             - processor (HOW): static (deliver `message` literally, no model) | \
             function (call `tool_name` with `tool_args` once) | agent (run an \
             isolated agent with `prompt`, `tools`, optional `model`)\n\
             \n\
             Rules:\n\
             - Cron expressions are five-field (minute hour day month weekday).\n\
             - The request arrives on channel '{originating_channel}'; set \
             `channel` only when the task names a different one.\n\
             - `tools` and `tool_name` may only use the catalog below.\n\
             - For monitors, the agent prompt must tell the agent to reply \
             [SKIP] when there is nothing to report.\n\
             \n\
             Available tools:\n{catalog}\n\
             Task: {task}",
            originating_channel = originating_channel,
            catalog = self.catalog,
            task = task,
        )
    }

    /// Produce a validated plan. Every failure — transport, schema,
    /// cross-field rules, unknown tool names — is `PlanInvalid` territory
    /// for the caller; nothing here falls back silently.
    pub async fn plan(&self, task: &str, originating_channel: &str) -> EngineResult<ExecutionPlan> {
        let messages = vec![Message::user(self.prompt(task, originating_channel))];
        let value = self
            .provider
            .chat_structured(&messages, &ExecutionPlan::json_schema(), &self.model)
            .await?;

        let mut plan: ExecutionPlan = serde_json::from_value(value)
            .map_err(|e| EngineError::PlanInvalid(format!("schema mismatch: {e}")))?;
        plan.validate().map_err(EngineError::PlanInvalid)?;

        if plan.channel.is_none() {
            plan.channel = Some(originating_channel.to_string());
        }

        // Closed tool-name space.
        if plan.processor == ProcessorKind::Function {
            if let Some(name) = &plan.tool_name {
                if !self.known_tools.contains(name) {
                    return Err(EngineError::PlanInvalid(format!("unknown tool '{name}'")));
                }
            }
        }
        if let Some(tools) = &plan.tools {
            for name in tools {
                if !self.known_tools.contains(name) {
                    return Err(EngineError::PlanInvalid(format!("unknown tool '{name}'")));
                }
            }
        }

        let summary: String = task.chars().take(80).collect();
        info!("[delegation] Planned {:?}/{:?} for '{}'", plan.execution, plan.processor, summary);
        Ok(plan)
    }

    /// The planner temperature is carried for hosts that route it into the
    /// provider call; the structured-output path pins its own decoding.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}
