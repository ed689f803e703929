// ── GraphBot Atoms: Runtime Defaults ───────────────────────────────────────
// Every tunable here is overridable through `engine::config::Config`; these
// are the values used when the config file omits the corresponding key.

/// Session rotation threshold: cumulative provider-reported tokens after
/// which the session is closed, summarized, and a fresh one opened.
pub const DEFAULT_SESSION_TOKEN_LIMIT: i64 = 30_000;

/// Maximum reason ⇄ execute_tools round trips per turn.
pub const DEFAULT_ITERATION_LIMIT: u32 = 8;

/// Conversation prefix loaded into each turn.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Iteration bound for isolated background agents.
pub const LIGHT_AGENT_ITERATION_LIMIT: u32 = 5;

/// Per-LLM-call timeout.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;

/// Per-tool-call timeout (function-processor trigger firings share it).
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Agent-processor trigger firings get a higher bound than tool calls.
pub const AGENT_PROCESSOR_TIMEOUT_SECS: u64 = 300;

/// Consecutive trigger errors before a cron job is auto-paused.
pub const JOB_AUTO_PAUSE_THRESHOLD: i64 = 3;

/// Scheduler owner-task tick interval.
pub const SCHEDULER_TICK_SECS: u64 = 20;

/// Outbound marker for bot-authored messages on shared-identity transports.
/// Doubles as the inbound loop-break filter.
pub const DEFAULT_BOT_PREFIX: &str = "[gbot] ";

/// Markers a monitor agent may emit to suppress delivery.
pub const SKIP_MARKERS: &[&str] = &["[SKIP]", "SKIP", "[NO_NOTIFY]"];

// ── Context layer token budgets ────────────────────────────────────────────

pub const BUDGET_IDENTITY: usize = 500;
pub const BUDGET_RUNTIME: usize = 100;
pub const BUDGET_ROLE: usize = 100;
pub const BUDGET_AGENT_MEMORY: usize = 500;
pub const BUDGET_USER_CONTEXT: usize = 1500;
pub const BUDGET_EVENTS: usize = 300;
pub const BUDGET_SESSION_SUMMARY: usize = 500;
pub const BUDGET_SKILLS: usize = 1000;
pub const BUDGET_SKILL_INDEX: usize = 200;

/// Tool groups never handed to isolated background agents.
pub const BACKGROUND_EXCLUDED_GROUPS: &[&str] =
    &["filesystem", "shell", "scheduling", "delegation"];

/// Placeholder written when summarization fails during rotation.
pub const SUMMARY_FALLBACK: &str = "(summary unavailable)";
