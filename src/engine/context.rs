// GraphBot Engine — Context Builder
// Budget-aware system prompt assembly from up to eight ordered layers:
//
//   identity → runtime → role → agent_memory → user_context → events →
//   session_summary → skills
//
// Each layer has a token budget; over-budget content keeps the most recent
// items (lists) or the head of the text, never splitting a UTF-8 character.
// Missing sources yield omitted sections, never errors. Output is
// deterministic for identical inputs.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::atoms::constants::*;
use crate::atoms::error::EngineResult;
use crate::atoms::traits::{HeuristicCounter, TokenCounter};
use crate::engine::store::Store;

/// A skill available to the assistant. `always` skills inject their full
/// text; the rest are summarized into a name+description index.
#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub content: String,
    pub always: bool,
}

/// The assembled prompt plus the event rows it rendered, so the caller can
/// mark them delivered after the turn reaches the model.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub system_prompt: String,
    pub rendered_event_ids: Vec<i64>,
}

pub struct ContextBuilder {
    store: Arc<Store>,
    counter: Arc<dyn TokenCounter>,
    /// Host-loaded identity text (persona files).
    identity_text: String,
    /// Config override, prepended when set.
    identity_override: Option<String>,
    role_description: String,
    skills: Vec<SkillEntry>,
}

impl ContextBuilder {
    pub fn new(store: Arc<Store>) -> Self {
        ContextBuilder {
            store,
            counter: Arc::new(HeuristicCounter),
            identity_text: String::new(),
            identity_override: None,
            role_description: String::new(),
            skills: Vec::new(),
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_identity(mut self, text: &str, config_override: Option<&str>) -> Self {
        self.identity_text = text.to_string();
        self.identity_override = config_override.map(str::to_string);
        self
    }

    pub fn with_role_description(mut self, text: &str) -> Self {
        self.role_description = text.to_string();
        self
    }

    pub fn with_skills(mut self, skills: Vec<SkillEntry>) -> Self {
        self.skills = skills;
        self
    }

    /// Assemble the prompt for one turn.
    pub fn build(
        &self,
        user_id: &str,
        channel: &str,
        model: &str,
        allowed_layers: &HashSet<String>,
    ) -> EngineResult<BuiltContext> {
        self.build_at(user_id, channel, model, allowed_layers, Utc::now())
    }

    /// Deterministic variant: the runtime layer renders `now` instead of
    /// sampling the clock.
    pub fn build_at(
        &self,
        user_id: &str,
        channel: &str,
        model: &str,
        allowed_layers: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<BuiltContext> {
        let mut sections: Vec<String> = Vec::new();
        let mut rendered_event_ids = Vec::new();
        let allowed = |layer: &str| allowed_layers.contains(layer);

        if allowed("identity") {
            let mut identity = String::new();
            if let Some(over) = &self.identity_override {
                identity.push_str(over);
                identity.push('\n');
            }
            identity.push_str(&self.identity_text);
            if !identity.trim().is_empty() {
                sections.push(self.head_trimmed(identity.trim(), BUDGET_IDENTITY));
            }
        }

        if allowed("runtime") {
            let runtime = format!(
                "## Runtime\nuser: {}\nchannel: {}\ntime: {}\nmodel: {}",
                user_id,
                channel,
                now.format("%Y-%m-%d %H:%M UTC"),
                model,
            );
            sections.push(self.head_trimmed(&runtime, BUDGET_RUNTIME));
        }

        if allowed("role") && !self.role_description.is_empty() {
            sections.push(self.head_trimmed(&self.role_description, BUDGET_ROLE));
        }

        if allowed("agent_memory") {
            if let Some(memory) = self.store.get_agent_memory(user_id, "long_term")? {
                if !memory.is_empty() {
                    sections.push(format!(
                        "## Long-term memory\n{}",
                        self.head_trimmed(&memory, BUDGET_AGENT_MEMORY)
                    ));
                }
            }
        }

        if allowed("user_context") {
            let section = self.user_context_section(user_id)?;
            if !section.is_empty() {
                sections.push(section);
            }
        }

        if allowed("events") {
            let events = self.store.undelivered_events(user_id)?;
            if !events.is_empty() {
                let mut lines: Vec<String> = Vec::new();
                for event in &events {
                    rendered_event_ids.push(event.event_id);
                    lines.push(format!("- [{}] {}", event.kind, compact_payload(&event.payload)));
                }
                let body = lines.join("\n");
                sections.push(format!(
                    "## Background notifications\n{}",
                    self.tail_trimmed_lines(&body, BUDGET_EVENTS)
                ));
            }
        }

        if allowed("session_summary") {
            if let Some(closed) = self.store.last_closed_session(user_id, channel)? {
                if let Some(summary) = closed.summary.filter(|s| !s.is_empty()) {
                    sections.push(format!(
                        "## Previous session\n{}",
                        self.head_trimmed(&summary, BUDGET_SESSION_SUMMARY)
                    ));
                }
            }
        }

        if allowed("skills") && !self.skills.is_empty() {
            sections.push(self.skills_section());
        }

        Ok(BuiltContext { system_prompt: sections.join("\n\n"), rendered_event_ids })
    }

    /// Mark rendered events delivered. Exposed here so the graph's
    /// load_context node completes the read-render-mark cycle in one place.
    pub fn mark_events_delivered(&self, event_ids: &[i64]) -> EngineResult<()> {
        self.store.mark_events_delivered(event_ids)
    }

    fn user_context_section(&self, user_id: &str) -> EngineResult<String> {
        let notes = self.store.list_notes(user_id, 20)?;
        let activity = self.store.recent_activity(user_id, 10)?;
        let favorites = self.store.list_favorites(user_id, 10)?;
        let preferences = self.store.get_preferences(user_id)?;

        let mut parts: Vec<String> = Vec::new();
        if !notes.is_empty() {
            // Rendered oldest-first so tail-trimming drops the oldest items.
            let lines: Vec<String> =
                notes.iter().rev().map(|n| format!("- {}", n.content)).collect();
            parts.push(format!("### Notes\n{}", lines.join("\n")));
        }
        if !activity.is_empty() {
            let lines: Vec<String> =
                activity.iter().rev().map(|a| format!("- {}: {}", a.action, a.detail)).collect();
            parts.push(format!("### Recent activity\n{}", lines.join("\n")));
        }
        if !favorites.is_empty() {
            let lines: Vec<String> =
                favorites.iter().map(|f| format!("- {}: {}", f.label, f.content)).collect();
            parts.push(format!("### Favorites\n{}", lines.join("\n")));
        }
        if preferences.as_object().is_some_and(|o| !o.is_empty()) {
            parts.push(format!("### Preferences\n{}", preferences));
        }
        if parts.is_empty() {
            return Ok(String::new());
        }
        let body = parts.join("\n");
        Ok(format!(
            "## About the user\n{}",
            self.tail_trimmed_lines(&body, BUDGET_USER_CONTEXT)
        ))
    }

    fn skills_section(&self) -> String {
        let mut full = String::new();
        for skill in self.skills.iter().filter(|s| s.always) {
            full.push_str(&format!("### Skill: {}\n{}\n", skill.name, skill.content));
        }
        let mut section = String::from("## Skills\n");
        if !full.is_empty() && self.counter.count(&full) <= BUDGET_SKILLS {
            section.push_str(full.trim_end());
        } else if !full.is_empty() {
            section.push_str(&self.head_trimmed(full.trim_end(), BUDGET_SKILLS));
        }
        let index: Vec<String> = self
            .skills
            .iter()
            .filter(|s| !s.always)
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect();
        if !index.is_empty() {
            section.push_str("\n### Available skills\n");
            section.push_str(&self.head_trimmed(&index.join("\n"), BUDGET_SKILL_INDEX));
        }
        section
    }

    /// Keep the head of the text within the budget.
    fn head_trimmed(&self, text: &str, budget_tokens: usize) -> String {
        if self.counter.count(text) <= budget_tokens {
            return text.to_string();
        }
        // chars/4 inverse: budget_tokens*4 chars, backed off to a boundary.
        let mut end = 0;
        let mut kept = 0;
        for (idx, _) in text.char_indices() {
            if kept >= budget_tokens * 4 {
                break;
            }
            kept += 1;
            end = idx + text[idx..].chars().next().map_or(1, char::len_utf8);
        }
        format!("{}…", &text[..end])
    }

    /// Keep the most recent lines (the tail) within the budget. Lists are
    /// rendered newest-last, so trimming drops the oldest items first.
    fn tail_trimmed_lines(&self, text: &str, budget_tokens: usize) -> String {
        if self.counter.count(text) <= budget_tokens {
            return text.to_string();
        }
        let lines: Vec<&str> = text.lines().collect();
        let mut kept: Vec<&str> = Vec::new();
        let mut used = 0;
        for line in lines.iter().rev() {
            let cost = self.counter.count(line) + 1;
            if used + cost > budget_tokens {
                break;
            }
            used += cost;
            kept.push(line);
        }
        kept.reverse();
        kept.join("\n")
    }
}

fn compact_payload(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => {
            if let Some(text) = other.get("text").and_then(|t| t.as_str()) {
                text.to_string()
            } else {
                other.to_string()
            }
        }
    }
}
