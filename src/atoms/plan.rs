// ── GraphBot Atoms: Execution Plans ────────────────────────────────────────
// The typed contract between the delegation planner and everything that runs
// background work (scheduler triggers, subagent worker). Two independent
// axes: WHEN (execution) and HOW (processor).
//
// The planner's structured-output call must yield JSON that deserializes
// into `ExecutionPlan` AND passes `validate()`; anything else is a
// `PlanInvalid` error at the call site, never a silent fallback.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Immediate,
    Delayed,
    Recurring,
    Monitor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    /// Deliver a literal text through the channel port. No LLM.
    Static,
    /// Invoke a single tool; the tool is the entire side effect.
    Function,
    /// Run an isolated light agent; the agent owns delivery.
    Agent,
}

impl ProcessorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::Static => "static",
            ProcessorKind::Function => "function",
            ProcessorKind::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyCondition {
    Always,
    NotifySkip,
}

impl Default for NotifyCondition {
    fn default() -> Self {
        NotifyCondition::Always
    }
}

impl NotifyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyCondition::Always => "always",
            NotifyCondition::NotifySkip => "notify_skip",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub execution: ExecutionKind,
    pub processor: ProcessorKind,
    /// Required iff execution = delayed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<i64>,
    /// Required iff execution ∈ {recurring, monitor}.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub notify_condition: NotifyCondition,
    /// Defaults to the originating channel when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    // ── processor = static ──
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    // ── processor = function ──
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    // ── processor = agent ──
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ExecutionPlan {
    /// Check the cross-field requirements the schema alone cannot express.
    /// Returns the first violation as a human-readable message.
    pub fn validate(&self) -> Result<(), String> {
        match self.execution {
            ExecutionKind::Delayed => {
                if self.delay_seconds.is_none() {
                    return Err("delayed execution requires delay_seconds".into());
                }
            }
            ExecutionKind::Recurring | ExecutionKind::Monitor => {
                if self.cron_expr.as_deref().map_or(true, str::is_empty) {
                    return Err("recurring/monitor execution requires cron_expr".into());
                }
            }
            ExecutionKind::Immediate => {}
        }
        if self.execution == ExecutionKind::Monitor
            && self.notify_condition != NotifyCondition::NotifySkip
        {
            return Err("monitor execution requires notify_condition=notify_skip".into());
        }
        match self.processor {
            ProcessorKind::Static => {
                if self.message.as_deref().map_or(true, str::is_empty) {
                    return Err("static processor requires message".into());
                }
            }
            ProcessorKind::Function => {
                if self.tool_name.as_deref().map_or(true, str::is_empty) {
                    return Err("function processor requires tool_name".into());
                }
            }
            ProcessorKind::Agent => {
                if self.prompt.as_deref().map_or(true, str::is_empty) {
                    return Err("agent processor requires prompt".into());
                }
            }
        }
        Ok(())
    }

    /// The JSON schema handed to the provider's structured-output call.
    pub fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "execution": {
                    "type": "string",
                    "enum": ["immediate", "delayed", "recurring", "monitor"]
                },
                "processor": {
                    "type": "string",
                    "enum": ["static", "function", "agent"]
                },
                "delay_seconds": { "type": ["integer", "null"] },
                "cron_expr": { "type": ["string", "null"] },
                "notify_condition": {
                    "type": "string",
                    "enum": ["always", "notify_skip"]
                },
                "channel": { "type": ["string", "null"] },
                "message": { "type": ["string", "null"] },
                "tool_name": { "type": ["string", "null"] },
                "tool_args": { "type": ["object", "null"] },
                "prompt": { "type": ["string", "null"] },
                "tools": {
                    "type": ["array", "null"],
                    "items": { "type": "string" }
                },
                "model": { "type": ["string", "null"] }
            },
            "required": ["execution", "processor"],
            "additionalProperties": false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_plan() -> ExecutionPlan {
        ExecutionPlan {
            execution: ExecutionKind::Immediate,
            processor: ProcessorKind::Static,
            delay_seconds: None,
            cron_expr: None,
            notify_condition: NotifyCondition::Always,
            channel: None,
            message: Some("hello".into()),
            tool_name: None,
            tool_args: None,
            prompt: None,
            tools: None,
            model: None,
        }
    }

    #[test]
    fn delayed_requires_delay_seconds() {
        let mut p = base_plan();
        p.execution = ExecutionKind::Delayed;
        assert!(p.validate().is_err());
        p.delay_seconds = Some(7200);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn monitor_requires_cron_and_notify_skip() {
        let mut p = base_plan();
        p.execution = ExecutionKind::Monitor;
        p.cron_expr = Some("*/30 * * * *".into());
        assert!(p.validate().is_err()); // notify_condition still `always`
        p.notify_condition = NotifyCondition::NotifySkip;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn processor_payload_requirements() {
        let mut p = base_plan();
        p.message = None;
        assert!(p.validate().is_err());

        p.processor = ProcessorKind::Function;
        assert!(p.validate().is_err());
        p.tool_name = Some("send_message_to_user".into());
        assert!(p.validate().is_ok());

        p.processor = ProcessorKind::Agent;
        assert!(p.validate().is_err());
        p.prompt = Some("check the weather".into());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn serialized_plan_round_trips() {
        let mut p = base_plan();
        p.execution = ExecutionKind::Recurring;
        p.cron_expr = Some("0 9 * * 1-5".into());
        p.processor = ProcessorKind::Agent;
        p.message = None;
        p.prompt = Some("morning digest".into());
        p.tools = Some(vec!["web_fetch".into(), "send_message_to_user".into()]);

        let json = serde_json::to_string(&p).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.execution, ExecutionKind::Recurring);
        assert_eq!(back.cron_expr.as_deref(), Some("0 9 * * 1-5"));
        assert_eq!(back.tools.as_ref().unwrap().len(), 2);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
