// GraphBot Engine — Channel Port
// One place for everything outbound-text: adapter registry, identity
// resolution, the bot-voice prefix, and message splitting. The prefix is a
// single concept doing double duty — it marks autonomous bot speech on
// shared-identity transports AND breaks webhook echo loops on inbound.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::ChannelAdapter;
use crate::atoms::types::InboundMessage;
use crate::engine::config::ChannelConfig;
use crate::engine::store::Store;

pub struct ChannelRegistry {
    store: Arc<Store>,
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    /// Bot-voice marker, e.g. "[gbot] ".
    prefix: String,
}

impl ChannelRegistry {
    pub fn new(store: Arc<Store>, prefix: &str) -> Self {
        ChannelRegistry {
            store,
            adapters: RwLock::new(HashMap::new()),
            prefix: prefix.to_string(),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        info!("[channels] Registered adapter '{}'", adapter.name());
        self.adapters.write().insert(adapter.name().to_string(), adapter);
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Send bot-authored text to a user on a channel. Resolves the user's
    /// address, applies the bot-voice prefix on shared-identity transports,
    /// and splits under the platform size limit.
    pub async fn send(&self, user_id: &str, channel: &str, text: &str) -> EngineResult<()> {
        self.send_inner(user_id, channel, text, true).await
    }

    /// Relay owner-authored text verbatim — no bot-voice prefix.
    pub async fn relay(&self, user_id: &str, channel: &str, text: &str) -> EngineResult<()> {
        self.send_inner(user_id, channel, text, false).await
    }

    async fn send_inner(
        &self,
        user_id: &str,
        channel: &str,
        text: &str,
        bot_voice: bool,
    ) -> EngineResult<()> {
        let adapter = self
            .adapters
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| EngineError::channel(channel, "no adapter registered"))?;

        let address = self
            .store
            .channel_links_for_user(user_id)?
            .into_iter()
            .find(|l| l.channel == channel)
            .map(|l| l.channel_address)
            .ok_or_else(|| {
                EngineError::channel(channel, format!("user {} has no address here", user_id))
            })?;

        let body = if bot_voice && adapter.shared_identity() {
            format!("{}{}", self.prefix, text)
        } else {
            text.to_string()
        };

        for chunk in split_message(&body, adapter.max_message_len()) {
            adapter.deliver(&address, &chunk).await?;
        }
        Ok(())
    }

    /// Inbound loop-break: drop messages we sent ourselves. Only the
    /// combination matters — a self-originated message that carries the
    /// bot-voice marker.
    pub fn should_drop_inbound(&self, msg: &InboundMessage) -> bool {
        if msg.is_from_self && msg.text.starts_with(&self.prefix) {
            info!("[channels] Dropping self-prefixed inbound on {}", msg.channel);
            return true;
        }
        false
    }

    /// Config-driven DM / group scoping for one inbound message.
    pub fn check_access(&self, cfg: &ChannelConfig, msg: &InboundMessage) -> bool {
        if !cfg.enabled {
            return false;
        }
        if msg.is_group {
            let group = msg.group_address.as_deref().unwrap_or("");
            if !cfg.allowed_groups.is_empty()
                && !cfg.allowed_groups.iter().any(|g| g == group)
            {
                warn!("[channels] Group {} not allowlisted on {}", group, msg.channel);
                return false;
            }
            true
        } else {
            if !cfg.respond_to_dm && !cfg.monitor_dm {
                return false;
            }
            if !cfg.allowed_dms.is_empty()
                && !cfg.allowed_dms.iter().any(|a| a == &msg.channel_address)
            {
                warn!("[channels] DM {} not allowlisted on {}", msg.channel_address, msg.channel);
                return false;
            }
            true
        }
    }
}

/// Split a long message into chunks at a given limit, preferring paragraph,
/// then newline, then space breaks. Never splits inside a UTF-8 character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let window = floor_char_boundary(remaining, max_len);
        let head = &remaining[..window];
        let split_at = head
            .rfind("\n\n")
            .map(|i| i + 2)
            .or_else(|| head.rfind('\n').map(|i| i + 1))
            .or_else(|| head.rfind(' ').map(|i| i + 1))
            .unwrap_or(window);
        chunks.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ── Test adapter ───────────────────────────────────────────────────────────

pub mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every delivered (address, text) pair.
    pub struct RecordingAdapter {
        name: String,
        shared: bool,
        max_len: usize,
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingAdapter {
        pub fn new(name: &str, shared_identity: bool) -> Self {
            RecordingAdapter {
                name: name.to_string(),
                shared: shared_identity,
                max_len: 4000,
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn with_max_len(mut self, max_len: usize) -> Self {
            self.max_len = max_len;
            self
        }

        pub fn messages(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn shared_identity(&self) -> bool {
            self.shared
        }

        fn max_message_len(&self) -> usize {
            self.max_len
        }

        async fn deliver(&self, channel_address: &str, text: &str) -> EngineResult<()> {
            self.sent.lock().push((channel_address.to_string(), text.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingAdapter;
    use super::*;

    fn registry_with(adapter: Arc<RecordingAdapter>) -> ChannelRegistry {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.get_or_create_user("alice", None).unwrap();
        store.link_channel("alice", adapter.name(), "addr-1", None).unwrap();
        let registry = ChannelRegistry::new(store, "[gbot] ");
        registry.register(adapter);
        registry
    }

    #[tokio::test]
    async fn shared_identity_gets_prefix() {
        let adapter = Arc::new(RecordingAdapter::new("whatsapp", true));
        let registry = registry_with(adapter.clone());
        registry.send("alice", "whatsapp", "hello").await.unwrap();
        assert_eq!(adapter.messages(), vec!["[gbot] hello"]);
    }

    #[tokio::test]
    async fn dedicated_bot_identity_skips_prefix() {
        let adapter = Arc::new(RecordingAdapter::new("telegram", false));
        let registry = registry_with(adapter.clone());
        registry.send("alice", "telegram", "hello").await.unwrap();
        assert_eq!(adapter.messages(), vec!["hello"]);
    }

    #[tokio::test]
    async fn relay_never_prefixes() {
        let adapter = Arc::new(RecordingAdapter::new("whatsapp", true));
        let registry = registry_with(adapter.clone());
        registry.relay("alice", "whatsapp", "raw").await.unwrap();
        assert_eq!(adapter.messages(), vec!["raw"]);
    }

    #[tokio::test]
    async fn unknown_address_is_channel_error() {
        let adapter = Arc::new(RecordingAdapter::new("telegram", false));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = ChannelRegistry::new(store, "[gbot] ");
        registry.register(adapter);
        assert!(registry.send("nobody", "telegram", "x").await.is_err());
    }

    #[test]
    fn inbound_self_prefix_dropped() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = ChannelRegistry::new(store, "[gbot] ");
        let msg = InboundMessage {
            channel: "whatsapp".into(),
            channel_address: "+49".into(),
            text: "[gbot] I already said this".into(),
            is_from_self: true,
            is_group: false,
            group_address: None,
        };
        assert!(registry.should_drop_inbound(&msg));

        // Self-authored without the marker passes (owner typing on their own
        // account), as does the marker from someone else quoting the bot.
        let mut owner_typed = msg.clone();
        owner_typed.text = "just me".into();
        assert!(!registry.should_drop_inbound(&owner_typed));
        let mut quoted = msg.clone();
        quoted.is_from_self = false;
        assert!(!registry.should_drop_inbound(&quoted));
    }

    #[test]
    fn access_checks_dm_allowlist() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = ChannelRegistry::new(store, "[gbot] ");
        let cfg = ChannelConfig {
            enabled: true,
            allowed_groups: vec![],
            allowed_dms: vec!["+49".into()],
            respond_to_dm: true,
            monitor_dm: false,
        };
        let mut msg = InboundMessage {
            channel: "whatsapp".into(),
            channel_address: "+49".into(),
            text: "hi".into(),
            is_from_self: false,
            is_group: false,
            group_address: None,
        };
        assert!(registry.check_access(&cfg, &msg));
        msg.channel_address = "+1".into();
        assert!(!registry.check_access(&cfg, &msg));
    }

    #[test]
    fn split_message_prefers_paragraphs() {
        let msg = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_message(&msg, 80);
        assert_eq!(chunks[0], "a".repeat(60));
        assert_eq!(chunks[1], "b".repeat(60));
    }

    #[test]
    fn split_message_handles_utf8() {
        let msg = "ğ".repeat(100); // 2 bytes each
        let chunks = split_message(&msg, 33);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len() <= 33);
            assert!(c.chars().all(|ch| ch == 'ğ'));
        }
    }

    #[test]
    fn split_message_short_passthrough() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }
}
