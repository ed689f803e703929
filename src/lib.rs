// GraphBot — multi-channel AI assistant runtime.
//
// Two cores and the contracts that bind them:
//   engine/runner     — GraphRunner: session lifecycle, graph invocation,
//                       message persistence, session rotation
//   engine/graph      — the 4-node agent graph (load_context → reason ⇄
//                       execute_tools → respond) with RBAC filtering
//   engine/scheduler  — persistent cron + one-shot triggers, processor
//                       dispatch, failure auto-pause
//   engine/worker     — fire-and-forget immediate background execution
//   engine/delegation — natural language → typed ExecutionPlan
//   engine/store      — SQLite store, the single source of truth
//
// Layering rule: `atoms` holds pure data types and the canonical error enum
// (no I/O, no imports from `engine`); everything that runs lives in `engine`.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::plan::{ExecutionKind, ExecutionPlan, NotifyCondition, ProcessorKind};
pub use atoms::types::*;
pub use engine::config::Config;
pub use engine::runner::GraphRunner;
pub use engine::store::Store;
