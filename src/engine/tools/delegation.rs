// Delegation tool — the main agent's doorway to background work. One natural
// language task description goes in; the planner turns it into a typed
// ExecutionPlan which is routed by its execution axis: immediate → subagent
// worker, delayed → reminder, recurring/monitor → cron job.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::{ToolContext, ToolHandler, ToolRegistry, ToolSpec};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::plan::ExecutionKind;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "delegation",
        ToolSpec::new(
            "delegate_task",
            "Hand off a task to run in the background: now, after a delay, on a \
             schedule, or as a monitor. Describe the task in natural language, \
             including any timing.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "What should happen, including when"
                    }
                },
                "required": ["task"]
            }),
            Arc::new(DelegateTaskTool),
        ),
    );
}

struct DelegateTaskTool;

#[async_trait]
impl ToolHandler for DelegateTaskTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let task = args["task"]
            .as_str()
            .ok_or_else(|| EngineError::tool("delegate_task", "missing 'task'"))?;
        let planner = ctx
            .planner
            .as_ref()
            .ok_or_else(|| EngineError::tool("delegate_task", "delegation is not wired up"))?;

        // A bad plan is fatal for this delegation, not for the turn: the
        // model sees "planning failed" as the tool result and can react.
        let plan = match planner.plan(task, &ctx.channel).await {
            Ok(p) => p,
            Err(e) => {
                ctx.store.record_delegation(&ctx.user_id, task, "{}", "planning_failed")?;
                return Err(EngineError::tool("delegate_task", format!("planning failed: {e}")));
            }
        };

        let channel = plan.channel.clone().unwrap_or_else(|| ctx.channel.clone());
        let plan_json = serde_json::to_string(&plan)?;
        info!("[delegation] {} → {:?}/{:?}", ctx.user_id, plan.execution, plan.processor);

        let ack = match plan.execution {
            ExecutionKind::Immediate => {
                let worker = ctx.worker.as_ref().ok_or_else(|| {
                    EngineError::tool("delegate_task", "background worker is not wired up")
                })?;
                let task_id =
                    worker.spawn(&ctx.user_id, ctx.session_id.as_deref(), &plan, &channel)?;
                format!("Started background task {task_id}.")
            }
            ExecutionKind::Delayed => {
                let scheduler = ctx.scheduler.as_ref().ok_or_else(|| {
                    EngineError::tool("delegate_task", "scheduler is not wired up")
                })?;
                let delay = plan.delay_seconds.unwrap_or_default();
                let id = scheduler.add_delayed_reminder(&ctx.user_id, delay, &plan, &channel)?;
                format!("Scheduled reminder {id} in {delay} seconds.")
            }
            ExecutionKind::Recurring | ExecutionKind::Monitor => {
                let scheduler = ctx.scheduler.as_ref().ok_or_else(|| {
                    EngineError::tool("delegate_task", "scheduler is not wired up")
                })?;
                let cron_expr = plan.cron_expr.clone().unwrap_or_default();
                let id = scheduler.add_job(&ctx.user_id, &cron_expr, &plan, &channel)?;
                format!("Created scheduled job {id} ({cron_expr}).")
            }
        };

        ctx.store.record_delegation(&ctx.user_id, task, &plan_json, "accepted")?;
        Ok(ack)
    }
}
