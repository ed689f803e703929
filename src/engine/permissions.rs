// GraphBot Engine — Role-Based Access Control
// Resolves a user's role to tool names and context layers. Two-layer guard:
// the model only ever sees allowed tool definitions, and execute_tools
// re-checks every call, answering violations with a synthetic
// "permission denied" tool result instead of running anything.
//
// No role file ⇒ open policy: every caller gets every tool and every layer.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::UserRole;
use crate::engine::tools::ToolRegistry;

/// All known context layer names, in prompt order.
pub const ALL_LAYERS: &[&str] = &[
    "identity",
    "runtime",
    "role",
    "agent_memory",
    "user_context",
    "events",
    "session_summary",
    "skills",
];

#[derive(Debug, Clone, Deserialize)]
struct RoleFile {
    /// Optional name → tool-name lists; groups registered in code win on clash.
    #[serde(default)]
    tool_groups: HashMap<String, Vec<String>>,
    roles: HashMap<String, RoleDef>,
    default_role: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RoleDef {
    #[serde(default)]
    tool_groups: Vec<String>,
    #[serde(default)]
    context_layers: Vec<String>,
    /// 0 = unlimited.
    #[serde(default)]
    max_sessions: u32,
}

pub struct Permissions {
    policy: Option<RoleFile>,
}

impl Permissions {
    /// Open policy — everything allowed for everyone.
    pub fn open() -> Self {
        Permissions { policy: None }
    }

    /// Load the role file. A missing file degrades open; a malformed one is
    /// a fatal config error.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            warn!("[permissions] {} not found — open policy, all tools for everyone", path.display());
            return Ok(Permissions::open());
        }
        let raw = std::fs::read_to_string(path)?;
        let policy: RoleFile = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("role file {}: {}", path.display(), e)))?;
        if !policy.roles.contains_key(&policy.default_role) {
            return Err(EngineError::Config(format!(
                "role file default_role '{}' is not defined",
                policy.default_role
            )));
        }
        Ok(Permissions { policy: Some(policy) })
    }

    fn role_def<'a>(&'a self, role: UserRole) -> Option<&'a RoleDef> {
        let policy = self.policy.as_ref()?;
        policy
            .roles
            .get(role.as_str())
            .or_else(|| policy.roles.get(&policy.default_role))
    }

    /// Union of tool names in the role's groups, resolved from the registry
    /// (file-declared groups included). Unknown group names are logged and
    /// skipped, not fatal.
    pub fn allowed_tools(&self, role: UserRole, registry: &ToolRegistry) -> HashSet<String> {
        let policy = match &self.policy {
            Some(p) => p,
            None => return registry.all_tool_names(),
        };
        let def = match self.role_def(role) {
            Some(d) => d,
            None => return HashSet::new(),
        };
        let mut tools = HashSet::new();
        for group in &def.tool_groups {
            let from_registry = registry.tools_in_group(group);
            let from_file = policy.tool_groups.get(group);
            if from_registry.is_empty() && from_file.is_none() {
                warn!("[permissions] Unknown tool group '{}' for role {}", group, role.as_str());
                continue;
            }
            tools.extend(from_registry);
            if let Some(names) = from_file {
                tools.extend(names.iter().cloned());
            }
        }
        tools
    }

    pub fn allowed_context_layers(&self, role: UserRole) -> HashSet<String> {
        match self.role_def(role) {
            None => ALL_LAYERS.iter().map(|s| s.to_string()).collect(),
            Some(def) => def.context_layers.iter().cloned().collect(),
        }
    }

    /// 0 = unlimited.
    pub fn max_sessions(&self, role: UserRole) -> u32 {
        self.role_def(role).map_or(0, |d| d.max_sessions)
    }
}
