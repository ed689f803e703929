// Scheduling tools — list and cancel a user's own background triggers.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ToolContext, ToolHandler, ToolRegistry, ToolSpec};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::scheduler::TriggerKind;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "scheduling",
        ToolSpec::new(
            "list_scheduled",
            "List the user's scheduled jobs and pending reminders.",
            serde_json::json!({ "type": "object", "properties": {} }),
            Arc::new(ListScheduledTool),
        ),
    );
    registry.register(
        "scheduling",
        ToolSpec::new(
            "cancel_scheduled",
            "Cancel a scheduled job or reminder by id.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["job", "reminder"] },
                    "id": { "type": "string" }
                },
                "required": ["kind", "id"]
            }),
            Arc::new(CancelScheduledTool),
        ),
    );
}

fn scheduler_of(ctx: &ToolContext) -> EngineResult<&crate::engine::scheduler::SchedulerHandle> {
    ctx.scheduler
        .as_ref()
        .ok_or_else(|| EngineError::tool("scheduling", "scheduler is not wired up"))
}

struct ListScheduledTool;

#[async_trait]
impl ToolHandler for ListScheduledTool {
    async fn invoke(&self, _args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let scheduler = scheduler_of(ctx)?;
        let (jobs, reminders) = scheduler.list(&ctx.user_id)?;
        if jobs.is_empty() && reminders.is_empty() {
            return Ok("Nothing scheduled.".into());
        }
        let mut out = String::new();
        for job in jobs {
            out.push_str(&format!(
                "job {} — cron '{}' on {} ({}){}\n",
                job.job_id,
                job.cron_expr,
                job.channel,
                job.processor,
                if job.enabled { "" } else { " [paused]" },
            ));
        }
        for r in reminders {
            out.push_str(&format!(
                "reminder {} — at {} on {} ({}, {})\n",
                r.reminder_id, r.run_at, r.channel, r.processor, r.status,
            ));
        }
        Ok(out)
    }
}

struct CancelScheduledTool;

#[async_trait]
impl ToolHandler for CancelScheduledTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let scheduler = scheduler_of(ctx)?;
        let id = args["id"]
            .as_str()
            .ok_or_else(|| EngineError::tool("cancel_scheduled", "missing 'id'"))?;
        let kind = match args["kind"].as_str() {
            Some("job") => TriggerKind::Job,
            Some("reminder") => TriggerKind::Reminder,
            _ => return Err(EngineError::tool("cancel_scheduled", "kind must be job|reminder")),
        };
        if scheduler.cancel(kind, id)? {
            Ok(format!("Cancelled {id}."))
        } else {
            Ok(format!("Nothing to cancel — {id} not found."))
        }
    }
}
