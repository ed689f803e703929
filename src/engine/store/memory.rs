use rusqlite::{params, OptionalExtension};

use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ActivityEntry, Favorite, NoteSource, UserNote};

impl Store {
    // ── Agent memory (key/value, consumed by the context builder) ──────

    pub fn set_agent_memory(&self, user_id: &str, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO agent_memory (user_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_agent_memory(&self, user_id: &str, key: &str) -> EngineResult<Option<String>> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM agent_memory WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // ── Notes ──────────────────────────────────────────────────────────

    pub fn add_note(&self, user_id: &str, content: &str, source: NoteSource) -> EngineResult<String> {
        let conn = self.lock();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO user_notes (id, user_id, content, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, user_id, content, source.as_str(), now_rfc3339()],
        )?;
        Ok(id)
    }

    /// Most recent first.
    pub fn list_notes(&self, user_id: &str, limit: usize) -> EngineResult<Vec<UserNote>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, content, source, created_at
             FROM user_notes WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let notes = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(UserNote {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    content: row.get(2)?,
                    source: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(notes)
    }

    // ── Preferences (one JSON document per user, shallow merge) ────────

    pub fn merge_preferences(&self, user_id: &str, incoming: &serde_json::Value) -> EngineResult<()> {
        let conn = self.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT data FROM preferences WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        let mut doc = existing
            .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        // Shallow merge: incoming keys overwrite, untouched keys survive.
        // A non-object on either side is replaced wholesale.
        match (doc.as_object_mut(), incoming.as_object()) {
            (Some(target), Some(src)) => {
                for (k, v) in src {
                    target.insert(k.clone(), v.clone());
                }
            }
            _ => doc = incoming.clone(),
        }

        conn.execute(
            "INSERT OR REPLACE INTO preferences (user_id, data, updated_at) VALUES (?1, ?2, ?3)",
            params![user_id, doc.to_string(), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_preferences(&self, user_id: &str) -> EngineResult<serde_json::Value> {
        let conn = self.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM preferences WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or_else(|| serde_json::json!({})))
    }

    // ── Favorites ──────────────────────────────────────────────────────

    pub fn add_favorite(&self, user_id: &str, label: &str, content: &str) -> EngineResult<String> {
        let conn = self.lock();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO favorites (id, user_id, label, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, user_id, label, content, now_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn list_favorites(&self, user_id: &str, limit: usize) -> EngineResult<Vec<Favorite>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, label, content, created_at
             FROM favorites WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let favorites = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(Favorite {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    label: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(favorites)
    }

    // ── Activity log ───────────────────────────────────────────────────

    pub fn log_activity(&self, user_id: &str, action: &str, detail: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO activity_log (id, user_id, action, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uuid::Uuid::new_v4().to_string(), user_id, action, detail, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_activity(&self, user_id: &str, limit: usize) -> EngineResult<Vec<ActivityEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, action, detail, created_at
             FROM activity_log WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(ActivityEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    action: row.get(2)?,
                    detail: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }
}
