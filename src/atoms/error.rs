// ── GraphBot Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the runtime, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Plan…).
//   • The `#[from]` attribute wires std/external error conversions.
//   • `EngineError` → `String` conversion is provided via `Display` so the
//     serving boundary (`Result<T, String>`) can call `.map_err(|e|
//     e.to_string())` without boilerplate.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Startup configuration is invalid or missing. Fatal.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication / authorization failure at the boundary.
    /// Never crosses into the agent graph.
    #[error("Auth error: {0}")]
    Auth(String),

    /// The caller exceeded its per-user request quota. Returned before any
    /// graph invocation; no side effects have occurred.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The user id has no row and auto-creation is disabled.
    #[error("Unknown user: {0}")]
    UserUnknown(String),

    /// LLM provider HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Tool execution failure. Observable output — the graph keeps going.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// A tool call was blocked by the role policy.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The delegation planner returned schema-invalid output.
    #[error("Invalid execution plan: {0}")]
    PlanInvalid(String),

    /// Channel / bridge failure.
    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    /// A scheduled trigger failed to execute. Logged and counted toward
    /// the owning job's auto-pause threshold.
    #[error("Scheduled execution error: {0}")]
    Schedule(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    /// Create a channel error with name and message.
    pub fn channel(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel { channel: channel.into(), message: message.into() }
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helpers returning `Result<T, String>` inside functions that
// return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All runtime operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ───────────────────────────────────────
// Lets serving-boundary functions call `.map_err(EngineError::into)` directly.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
