// GraphBot Engine — Tool Registry & Dispatcher
// Named groups of callable tools with introspectable metadata. New tools
// register into a group in code; nothing else needs editing. Tools whose
// binary/env requirements are unmet stay *known* (available = false) so the
// permission layer can reference them without error — they are simply never
// offered to the model or executed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::atoms::constants::{BACKGROUND_EXCLUDED_GROUPS, DEFAULT_TOOL_TIMEOUT_SECS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ToolCall, ToolDefinition, ToolOutput};
use crate::engine::channels::ChannelRegistry;
use crate::engine::config::Config;
use crate::engine::store::Store;

pub mod delegation;
pub mod memory;
pub mod messaging;
pub mod scheduling;

// ── Execution context ──────────────────────────────────────────────────────

/// Everything a tool may touch, threaded per-call. Background executions get
/// a context without scheduler/worker/planner handles (those groups are
/// excluded from the background subregistry anyway).
#[derive(Clone)]
pub struct ToolContext {
    pub store: Arc<Store>,
    pub channels: Arc<ChannelRegistry>,
    pub config: Arc<Config>,
    pub user_id: String,
    /// The session channel; injected into tool args when the model omits it.
    pub channel: String,
    pub session_id: Option<String>,
    pub scheduler: Option<crate::engine::scheduler::SchedulerHandle>,
    pub worker: Option<Arc<crate::engine::worker::SubagentWorker>>,
    pub planner: Option<Arc<crate::engine::delegation::DelegationPlanner>>,
}

impl ToolContext {
    /// Minimal context for background executions.
    pub fn background(
        store: Arc<Store>,
        channels: Arc<ChannelRegistry>,
        config: Arc<Config>,
        user_id: &str,
        channel: &str,
    ) -> Self {
        ToolContext {
            store,
            channels,
            config,
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            session_id: None,
            scheduler: None,
            worker: None,
            planner: None,
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String>;
}

// ── Descriptors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Requirements {
    pub binaries: Vec<String>,
    pub env_vars: Vec<String>,
}

impl Requirements {
    /// A requirement set is met when every binary resolves on PATH and every
    /// env var is non-empty.
    pub fn met(&self) -> bool {
        self.binaries.iter().all(|b| binary_on_path(b))
            && self.env_vars.iter().all(|v| std::env::var(v).map_or(false, |x| !x.is_empty()))
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else { return false };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub requires: Requirements,
    pub available: bool,
    pub handler: Arc<dyn ToolHandler>,
    /// Per-tool execution timeout.
    pub timeout: Duration,
}

impl ToolSpec {
    pub fn new(
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            requires: Requirements::default(),
            available: true,
            handler,
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }

    pub fn with_requirements(mut self, requires: Requirements) -> Self {
        self.available = requires.met();
        self.requires = requires;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(&self.name, &self.description, self.parameters.clone())
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ToolRegistry {
    /// BTreeMap for deterministic iteration (catalog text, definitions).
    groups: BTreeMap<String, Vec<ToolSpec>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    /// The built-in groups every deployment carries.
    pub fn with_builtins() -> Self {
        let mut registry = ToolRegistry::new();
        messaging::register(&mut registry);
        memory::register(&mut registry);
        scheduling::register(&mut registry);
        delegation::register(&mut registry);
        registry
    }

    pub fn register(&mut self, group: &str, spec: ToolSpec) {
        if !spec.available {
            warn!("[tools] '{}' registered unavailable (unmet requirements)", spec.name);
        }
        self.groups.entry(group.to_string()).or_default().push(spec);
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn tools_in_group(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|specs| specs.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn all_tool_names(&self) -> HashSet<String> {
        self.groups.values().flatten().map(|s| s.name.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&ToolSpec> {
        self.groups.values().flatten().find(|s| s.name == name)
    }

    /// Definitions offered to the model: allowed AND available.
    pub fn definitions(&self, allowed: &HashSet<String>) -> Vec<ToolDefinition> {
        self.groups
            .values()
            .flatten()
            .filter(|s| s.available && allowed.contains(&s.name))
            .map(|s| s.definition())
            .collect()
    }

    /// Tool names safe to hand to isolated background agents: everything
    /// outside the filesystem / shell / scheduling / delegation groups.
    pub fn background_tool_names(&self) -> HashSet<String> {
        self.groups
            .iter()
            .filter(|(group, _)| !BACKGROUND_EXCLUDED_GROUPS.contains(&group.as_str()))
            .flat_map(|(_, specs)| specs.iter().map(|s| s.name.clone()))
            .collect()
    }

    /// Resolve a requested background tool subset against the safe set.
    /// Unknown or excluded names are dropped.
    pub fn resolve_background_subset(&self, requested: &[String]) -> Vec<ToolDefinition> {
        let safe = self.background_tool_names();
        requested
            .iter()
            .filter(|name| safe.contains(*name))
            .filter_map(|name| self.find(name))
            .filter(|s| s.available)
            .map(|s| s.definition())
            .collect()
    }

    /// Human-readable catalog: one line per available tool.
    pub fn catalog_text(&self) -> String {
        self.catalog(|_| true)
    }

    /// Catalog restricted to the background-safe groups — what the planner
    /// may hand to scheduled plans.
    pub fn background_catalog_text(&self) -> String {
        self.catalog(|group| !BACKGROUND_EXCLUDED_GROUPS.contains(&group))
    }

    fn catalog(&self, include_group: impl Fn(&str) -> bool) -> String {
        let mut out = String::new();
        for (group, specs) in &self.groups {
            if !include_group(group) {
                continue;
            }
            for spec in specs {
                if !spec.available {
                    continue;
                }
                out.push_str(&format!("- {} ({}): {}\n", spec.name, group, spec.description));
            }
        }
        out
    }
}

// ── Executor ───────────────────────────────────────────────────────────────

/// Execute one tool call. Never panics and never propagates — tool failures
/// are observable outputs the model can react to.
pub async fn execute_tool(registry: &ToolRegistry, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
    let name = &call.function.name;
    let args_str = &call.function.arguments;
    info!("[tools] Executing {} user={} args={}", name, ctx.user_id, preview(args_str, 200));

    let spec = match registry.find(name) {
        Some(s) if s.available => s,
        Some(_) => {
            return ToolOutput {
                tool_call_id: call.id.clone(),
                output: format!("Error: tool '{}' is not available on this deployment", name),
                success: false,
            }
        }
        None => {
            return ToolOutput {
                tool_call_id: call.id.clone(),
                output: format!("Error: unknown tool '{}'", name),
                success: false,
            }
        }
    };

    let mut args: serde_json::Value = match serde_json::from_str(args_str) {
        Ok(v) => v,
        Err(e) => {
            warn!("[tools] Malformed args for '{}': {}", name, e);
            return ToolOutput {
                tool_call_id: call.id.clone(),
                output: format!("Error: malformed JSON arguments: {}", e),
                success: false,
            };
        }
    };

    // Channel injection: tools that accept a channel get the session channel
    // when the model omitted it.
    if spec.parameters["properties"].get("channel").is_some() {
        let missing = args.get("channel").and_then(|c| c.as_str()).map_or(true, str::is_empty);
        if missing {
            if let Some(obj) = args.as_object_mut() {
                obj.insert("channel".into(), serde_json::Value::String(ctx.channel.clone()));
            }
        }
    }

    let result = tokio::time::timeout(spec.timeout, spec.handler.invoke(args, ctx)).await;
    match result {
        Ok(Ok(output)) => ToolOutput { tool_call_id: call.id.clone(), output, success: true },
        Ok(Err(e)) => ToolOutput {
            tool_call_id: call.id.clone(),
            output: format!("Error: {}", e),
            success: false,
        },
        Err(_) => ToolOutput {
            tool_call_id: call.id.clone(),
            output: format!("Error: tool '{}' timed out after {:?}", name, spec.timeout),
            success: false,
        },
    }
}

/// Byte-bounded log preview that never splits a UTF-8 character.
fn preview(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Test helpers ───────────────────────────────────────────────────────────

pub mod testing {
    use super::*;

    /// Echoes its arguments back. Handy for graph and scheduler tests.
    pub struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn invoke(&self, args: serde_json::Value, _ctx: &ToolContext) -> EngineResult<String> {
            Ok(args.to_string())
        }
    }

    /// One echo tool per conventional group, named `echo_<group>`.
    pub fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for group in ["messaging", "memory", "filesystem", "shell", "scheduling", "delegation", "web"] {
            registry.register(
                group,
                ToolSpec::new(
                    &format!("echo_{group}"),
                    "echoes arguments",
                    serde_json::json!({"type": "object", "properties": {"channel": {"type": "string"}}}),
                    Arc::new(EchoTool),
                ),
            );
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::engine::channels::ChannelRegistry;

    fn ctx() -> ToolContext {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = Arc::new(Config::default());
        let channels = Arc::new(ChannelRegistry::new(store.clone(), &config.channels.prefix));
        ToolContext::background(store, channels, config, "alice", "telegram")
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: crate::atoms::types::FunctionCall {
                name: name.into(),
                arguments: args.into(),
            },
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_output() {
        let registry = echo_registry();
        let out = execute_tool(&registry, &call("nope", "{}"), &ctx()).await;
        assert!(!out.success);
        assert!(out.output.contains("unknown tool"));
    }

    #[tokio::test]
    async fn malformed_args_are_an_error_output() {
        let registry = echo_registry();
        let out = execute_tool(&registry, &call("echo_web", "{not json"), &ctx()).await;
        assert!(!out.success);
        assert!(out.output.contains("malformed"));
    }

    #[tokio::test]
    async fn channel_injected_when_omitted() {
        let registry = echo_registry();
        let out = execute_tool(&registry, &call("echo_messaging", "{}"), &ctx()).await;
        assert!(out.success);
        assert!(out.output.contains("telegram"));

        // Explicit channel is preserved.
        let out =
            execute_tool(&registry, &call("echo_messaging", r#"{"channel":"whatsapp"}"#), &ctx())
                .await;
        assert!(out.output.contains("whatsapp"));
    }

    #[test]
    fn background_subset_excludes_sensitive_groups() {
        let registry = echo_registry();
        let safe = registry.background_tool_names();
        assert!(safe.contains("echo_messaging"));
        assert!(safe.contains("echo_web"));
        for blocked in ["echo_filesystem", "echo_shell", "echo_scheduling", "echo_delegation"] {
            assert!(!safe.contains(blocked), "{blocked} should be excluded");
        }
    }

    #[test]
    fn unavailable_tools_stay_known() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "web",
            ToolSpec::new(
                "needs_ghost_binary",
                "never available",
                serde_json::json!({"type": "object", "properties": {}}),
                Arc::new(EchoTool),
            )
            .with_requirements(Requirements {
                binaries: vec!["definitely-not-a-real-binary-xyz".into()],
                env_vars: vec![],
            }),
        );
        assert!(registry.find("needs_ghost_binary").is_some());
        assert!(!registry.find("needs_ghost_binary").unwrap().available);
        assert!(registry.definitions(&registry.all_tool_names()).is_empty());
        assert!(!registry.catalog_text().contains("needs_ghost_binary"));
    }
}
