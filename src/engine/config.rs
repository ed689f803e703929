// GraphBot Engine — Runtime Configuration
// Serde-typed TOML with a Default for every section; a missing file is the
// defaults, a malformed file is a fatal ConfigError at startup.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::atoms::constants::{
    DEFAULT_BOT_PREFIX, DEFAULT_HISTORY_LIMIT, DEFAULT_ITERATION_LIMIT,
    DEFAULT_SESSION_TOKEN_LIMIT,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ProviderConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub assistant: AssistantConfig,
    pub background: BackgroundConfig,
    pub auth: AuthConfig,
    pub channels: ChannelsConfig,
    pub web: WebConfig,
    /// Optional retrieval wiring; opaque to the engine core.
    pub rag: Option<toml::Value>,
    #[serde(rename = "provider")]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Default model for the main agent graph.
    pub model: String,
    pub owner: OwnerConfig,
    /// Session rotation threshold in provider-reported tokens.
    pub session_token_limit: i64,
    /// Max reason ⇄ execute_tools rounds per turn.
    pub iteration_limit: u32,
    /// Conversation prefix length per turn.
    pub history_limit: usize,
    /// Create user rows on first contact; when false, unknown users error.
    pub auto_create_users: bool,
    /// One-line role description injected as a context layer.
    pub role_description: String,
    /// Identity text override; prepended to the identity layer when set.
    pub identity: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        AssistantConfig {
            model: "gpt-4o".into(),
            owner: OwnerConfig::default(),
            session_token_limit: DEFAULT_SESSION_TOKEN_LIMIT,
            iteration_limit: DEFAULT_ITERATION_LIMIT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            auto_create_users: true,
            role_description: "You are a personal assistant that can message, remember, \
                               and schedule things for its users."
                .into(),
            identity: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    /// Identifies the owner-role user at startup. Empty = no owner install.
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub delegation: DelegationConfig,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig { delegation: DelegationConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Planner model; empty = the assistant's default model.
    pub model: String,
    pub temperature: f64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        DelegationConfig { model: String::new(), temperature: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Empty string disables auth entirely (pass-through).
    pub jwt_secret_key: String,
    pub rate_limit: RateLimitConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig { jwt_secret_key: String::new(), rate_limit: RateLimitConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-user quota; 0 = unlimited.
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig { requests_per_minute: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Outbound marker for bot-authored messages on shared-identity
    /// transports; also the inbound loop-break filter.
    pub prefix: String,
    #[serde(flatten)]
    pub entries: HashMap<String, ChannelConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        ChannelsConfig { prefix: DEFAULT_BOT_PREFIX.into(), entries: HashMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Empty = all groups allowed.
    pub allowed_groups: Vec<String>,
    /// Empty = all DMs allowed.
    pub allowed_dms: Vec<String>,
    pub respond_to_dm: bool,
    pub monitor_dm: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            enabled: true,
            allowed_groups: Vec::new(),
            allowed_dms: Vec::new(),
            respond_to_dm: true,
            monitor_dm: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Short tag → URL, consulted by the web_fetch tool.
    pub fetch_shortcuts: HashMap<String, String>,
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults; a
    /// malformed one is fatal.
    pub fn load(path: &Path) -> EngineResult<Config> {
        if !path.exists() {
            log::info!("[config] {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// The planner model, falling back to the assistant default.
    pub fn delegation_model(&self) -> &str {
        if self.background.delegation.model.is_empty() {
            &self.assistant.model
        } else {
            &self.background.delegation.model
        }
    }

    pub fn channel(&self, name: &str) -> ChannelConfig {
        self.channels.entries.get(name).cloned().unwrap_or_default()
    }
}
