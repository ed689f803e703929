// Messaging tools — the only way agent output reaches a user outside the
// main conversation. Background agents rely on send_message_to_user for
// delivery; the scheduler deliberately never delivers on their behalf.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ToolContext, ToolHandler, ToolRegistry, ToolSpec};
use crate::atoms::error::{EngineError, EngineResult};

pub fn register(registry: &mut ToolRegistry) {
    registry.register(
        "messaging",
        ToolSpec::new(
            "send_message_to_user",
            "Send a text message to a user over a channel. Defaults to the current \
             user and the current channel when target_user/channel are omitted.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "target_user": {
                        "type": "string",
                        "description": "Display name or user id of the recipient"
                    },
                    "channel": {
                        "type": "string",
                        "description": "Channel to deliver on (telegram, whatsapp, …)"
                    },
                    "message": { "type": "string" }
                },
                "required": ["message"]
            }),
            Arc::new(SendMessageTool),
        ),
    );
}

struct SendMessageTool;

#[async_trait]
impl ToolHandler for SendMessageTool {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> EngineResult<String> {
        let message = args["message"]
            .as_str()
            .ok_or_else(|| EngineError::tool("send_message_to_user", "missing 'message'"))?;
        let channel = args["channel"].as_str().unwrap_or(&ctx.channel);

        let target_id = match args["target_user"].as_str() {
            Some(name) if !name.is_empty() => ctx
                .store
                .find_user_by_name(name)?
                .map(|u| u.user_id)
                .ok_or_else(|| {
                    EngineError::tool("send_message_to_user", format!("no user named '{name}'"))
                })?,
            _ => ctx.user_id.clone(),
        };

        ctx.channels.send(&target_id, channel, message).await?;
        ctx.store
            .log_activity(&ctx.user_id, "message_sent", &format!("to {target_id} via {channel}"))?;
        Ok(format!("Message delivered to {target_id} via {channel}."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{FunctionCall, ToolCall};
    use crate::engine::channels::testing::RecordingAdapter;
    use crate::engine::channels::ChannelRegistry;
    use crate::engine::config::Config;
    use crate::engine::store::Store;
    use crate::engine::tools::execute_tool;

    fn setup() -> (ToolContext, Arc<RecordingAdapter>, ToolRegistry) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.get_or_create_user("alice", Some("Alice")).unwrap();
        store.get_or_create_user("murat", Some("Murat")).unwrap();
        store.link_channel("alice", "whatsapp", "+49-alice", None).unwrap();
        store.link_channel("murat", "whatsapp", "+90-murat", None).unwrap();

        let config = Arc::new(Config::default());
        let channels = Arc::new(ChannelRegistry::new(store.clone(), "[gbot] "));
        let adapter = Arc::new(RecordingAdapter::new("whatsapp", true));
        channels.register(adapter.clone());

        let mut registry = ToolRegistry::new();
        register(&mut registry);
        let ctx = ToolContext::background(store, channels, config, "alice", "whatsapp");
        (ctx, adapter, registry)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "send_message_to_user".into(),
                arguments: args.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn sends_to_named_target() {
        let (ctx, adapter, registry) = setup();
        let out = execute_tool(
            &registry,
            &call(serde_json::json!({"target_user": "Murat", "message": "naber"})),
            &ctx,
        )
        .await;
        assert!(out.success, "{}", out.output);
        let sent = adapter.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+90-murat");
        assert_eq!(sent[0].1, "[gbot] naber");
    }

    #[tokio::test]
    async fn defaults_to_calling_user_and_channel() {
        let (ctx, adapter, registry) = setup();
        let out =
            execute_tool(&registry, &call(serde_json::json!({"message": "hi"})), &ctx).await;
        assert!(out.success);
        assert_eq!(adapter.sent.lock()[0].0, "+49-alice");
    }

    #[tokio::test]
    async fn unknown_target_fails_observably() {
        let (ctx, _adapter, registry) = setup();
        let out = execute_tool(
            &registry,
            &call(serde_json::json!({"target_user": "Nobody", "message": "x"})),
            &ctx,
        )
        .await;
        assert!(!out.success);
        assert!(out.output.contains("no user named"));
    }
}
