use rusqlite::{params, OptionalExtension};

use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ApiKey, SystemEvent};

impl Store {
    // ── System event queue (at-least-once) ─────────────────────────────

    pub fn enqueue_event(
        &self,
        user_id: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> EngineResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO system_events (user_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, kind, payload.to_string(), now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest first, so consumers render in arrival order.
    pub fn undelivered_events(&self, user_id: &str) -> EngineResult<Vec<SystemEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, user_id, kind, payload, delivered_at, created_at
             FROM system_events WHERE user_id = ?1 AND delivered_at IS NULL
             ORDER BY event_id ASC",
        )?;
        let events = stmt
            .query_map(params![user_id], |row| {
                let payload: String = row.get(3)?;
                Ok(SystemEvent {
                    event_id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: row.get(2)?,
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::Null),
                    delivered_at: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    /// Marking twice is harmless; producers never delete.
    pub fn mark_events_delivered(&self, event_ids: &[i64]) -> EngineResult<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        let now = now_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE system_events SET delivered_at = ?2
             WHERE event_id = ?1 AND delivered_at IS NULL",
        )?;
        for id in event_ids {
            stmt.execute(params![id, now])?;
        }
        Ok(())
    }

    // ── API keys (audit surface; hashing happens at the boundary) ──────

    pub fn add_api_key(&self, user_id: &str, label: &str, key_hash: &str) -> EngineResult<String> {
        let conn = self.lock();
        let key_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO api_keys (key_id, user_id, label, key_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key_id, user_id, label, key_hash, now_rfc3339()],
        )?;
        Ok(key_id)
    }

    pub fn find_api_key(&self, key_hash: &str) -> EngineResult<Option<ApiKey>> {
        let conn = self.lock();
        let key = conn
            .query_row(
                "SELECT key_id, user_id, label, key_hash, created_at, last_used_at
                 FROM api_keys WHERE key_hash = ?1",
                params![key_hash],
                |row| {
                    Ok(ApiKey {
                        key_id: row.get(0)?,
                        user_id: row.get(1)?,
                        label: row.get(2)?,
                        key_hash: row.get(3)?,
                        created_at: row.get(4)?,
                        last_used_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        if let Some(ref k) = key {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?2 WHERE key_id = ?1",
                params![k.key_id, now_rfc3339()],
            )?;
        }
        Ok(key)
    }

    // ── Delegation audit ───────────────────────────────────────────────

    pub fn record_delegation(
        &self,
        user_id: &str,
        request: &str,
        plan_json: &str,
        outcome: &str,
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO delegation_log (user_id, request, plan_json, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, request, plan_json, outcome, now_rfc3339()],
        )?;
        Ok(())
    }
}
