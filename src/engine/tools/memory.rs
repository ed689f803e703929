// Memory tools — notes, preferences, favorites, and the long-term agent
// memory record the context builder reads back on later turns.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ToolContext, ToolHandler, ToolRegistry, ToolSpec};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::NoteSource;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "memory",
        ToolSpec::new(
            "save_note",
            "Save a durable note about the user (facts, situations, plans).",
            serde_json::json!({
                "type": "object",
                "properties": { "content": { "type": "string" } },
                "required": ["content"]
            }),
            Arc::new(SaveNoteTool),
        ),
    );
    registry.register(
        "memory",
        ToolSpec::new(
            "save_preference",
            "Save or update one user preference as a key/value pair.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "value": {}
                },
                "required": ["key", "value"]
            }),
            Arc::new(SavePreferenceTool),
        ),
    );
    registry.register(
        "memory",
        ToolSpec::new(
            "add_favorite",
            "Bookmark a labeled snippet for the user.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "label": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["label", "content"]
            }),
            Arc::new(AddFavoriteTool),
        ),
    );
    registry.register(
        "memory",
        ToolSpec::new(
            "update_agent_memory",
            "Overwrite the assistant's long-term memory record for this user.",
            serde_json::json!({
                "type": "object",
                "properties": { "content": { "type": "string" } },
                "required": ["content"]
            }),
            Arc::new(UpdateAgentMemoryTool),
        ),
    );
}

struct SaveNoteTool;

#[async_trait]
impl ToolHandler for SaveNoteTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let content = args["content"]
            .as_str()
            .ok_or_else(|| EngineError::tool("save_note", "missing 'content'"))?;
        ctx.store.add_note(&ctx.user_id, content, NoteSource::Conversation)?;
        ctx.store.log_activity(&ctx.user_id, "note_added", content)?;
        Ok("Note saved.".into())
    }
}

struct SavePreferenceTool;

#[async_trait]
impl ToolHandler for SavePreferenceTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let key = args["key"]
            .as_str()
            .ok_or_else(|| EngineError::tool("save_preference", "missing 'key'"))?;
        let value = args
            .get("value")
            .cloned()
            .ok_or_else(|| EngineError::tool("save_preference", "missing 'value'"))?;
        let mut doc = serde_json::Map::new();
        doc.insert(key.to_string(), value);
        ctx.store.merge_preferences(&ctx.user_id, &serde_json::Value::Object(doc))?;
        ctx.store.log_activity(&ctx.user_id, "preference_set", key)?;
        Ok(format!("Preference '{key}' saved."))
    }
}

struct AddFavoriteTool;

#[async_trait]
impl ToolHandler for AddFavoriteTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let label = args["label"]
            .as_str()
            .ok_or_else(|| EngineError::tool("add_favorite", "missing 'label'"))?;
        let content = args["content"].as_str().unwrap_or_default();
        ctx.store.add_favorite(&ctx.user_id, label, content)?;
        ctx.store.log_activity(&ctx.user_id, "favorite_added", label)?;
        Ok(format!("Favorite '{label}' saved."))
    }
}

struct UpdateAgentMemoryTool;

#[async_trait]
impl ToolHandler for UpdateAgentMemoryTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let content = args["content"]
            .as_str()
            .ok_or_else(|| EngineError::tool("update_agent_memory", "missing 'content'"))?;
        ctx.store.set_agent_memory(&ctx.user_id, "long_term", content)?;
        Ok("Long-term memory updated.".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{FunctionCall, ToolCall};
    use crate::engine::channels::ChannelRegistry;
    use crate::engine::config::Config;
    use crate::engine::store::Store;
    use crate::engine::tools::execute_tool;

    fn setup() -> (ToolContext, ToolRegistry) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.get_or_create_user("alice", None).unwrap();
        let config = Arc::new(Config::default());
        let channels = Arc::new(ChannelRegistry::new(store.clone(), "[gbot] "));
        let mut registry = ToolRegistry::new();
        register(&mut registry);
        (ToolContext::background(store, channels, config, "alice", "api"), registry)
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: FunctionCall { name: name.into(), arguments: args.to_string() },
        }
    }

    #[tokio::test]
    async fn note_and_activity_written() {
        let (ctx, registry) = setup();
        let out = execute_tool(
            &registry,
            &call("save_note", serde_json::json!({"content": "likes tea"})),
            &ctx,
        )
        .await;
        assert!(out.success);
        let notes = ctx.store.list_notes("alice", 10).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].source, "conversation");
        assert_eq!(ctx.store.recent_activity("alice", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preference_merges_into_document() {
        let (ctx, registry) = setup();
        execute_tool(
            &registry,
            &call("save_preference", serde_json::json!({"key": "lang", "value": "tr"})),
            &ctx,
        )
        .await;
        let prefs = ctx.store.get_preferences("alice").unwrap();
        assert_eq!(prefs["lang"], "tr");
    }

    #[tokio::test]
    async fn agent_memory_overwrites() {
        let (ctx, registry) = setup();
        execute_tool(
            &registry,
            &call("update_agent_memory", serde_json::json!({"content": "v1"})),
            &ctx,
        )
        .await;
        assert_eq!(
            ctx.store.get_agent_memory("alice", "long_term").unwrap().as_deref(),
            Some("v1")
        );
    }
}
