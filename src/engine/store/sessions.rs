use log::info;
use rusqlite::{params, OptionalExtension};

use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Session, StoredMessage, ToolCall};

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        channel: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        summary: row.get(5)?,
        token_count: row.get(6)?,
        close_reason: row.get(7)?,
    })
}

const SESSION_COLS: &str =
    "session_id, user_id, channel, started_at, ended_at, summary, token_count, close_reason";

impl Store {
    // ── Session lifecycle ──────────────────────────────────────────────

    pub fn open_session(&self, user_id: &str, channel: &str) -> EngineResult<Session> {
        let conn = self.lock();
        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = now_rfc3339();
        conn.execute(
            "INSERT INTO sessions (session_id, user_id, channel, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, user_id, channel, started_at],
        )?;
        info!("[store] Opened session {} for {}/{}", session_id, user_id, channel);
        Ok(Session {
            session_id,
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            started_at,
            ended_at: None,
            summary: None,
            token_count: 0,
            close_reason: None,
        })
    }

    pub fn get_session(&self, session_id: &str) -> EngineResult<Option<Session>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE session_id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn get_open_session(&self, user_id: &str, channel: &str) -> EngineResult<Option<Session>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM sessions
                     WHERE user_id = ?1 AND channel = ?2 AND ended_at IS NULL
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![user_id, channel],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Any open session for the user, regardless of channel. Used for the
    /// guest single-session cap.
    pub fn any_open_session(&self, user_id: &str) -> EngineResult<Option<Session>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM sessions
                     WHERE user_id = ?1 AND ended_at IS NULL
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![user_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn count_open_sessions(&self, user_id: &str) -> EngineResult<i64> {
        let conn = self.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND ended_at IS NULL",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Conditional close: only the first caller wins; later callers observe
    /// the already-closed row without error. Returns whether this call did
    /// the close.
    pub fn end_session(
        &self,
        session_id: &str,
        summary: &str,
        close_reason: &str,
    ) -> EngineResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET ended_at = ?2, summary = ?3, close_reason = ?4
             WHERE session_id = ?1 AND ended_at IS NULL",
            params![session_id, now_rfc3339(), summary, close_reason],
        )?;
        if changed > 0 {
            info!("[store] Closed session {} ({})", session_id, close_reason);
        }
        Ok(changed > 0)
    }

    pub fn add_session_tokens(&self, session_id: &str, tokens: i64) -> EngineResult<i64> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET token_count = token_count + ?2 WHERE session_id = ?1",
            params![session_id, tokens],
        )?;
        let total = conn.query_row(
            "SELECT token_count FROM sessions WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// The most recent closed session for (user, channel) — feeds the
    /// session_summary context layer.
    pub fn last_closed_session(&self, user_id: &str, channel: &str) -> EngineResult<Option<Session>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM sessions
                     WHERE user_id = ?1 AND channel = ?2 AND ended_at IS NOT NULL
                     ORDER BY ended_at DESC LIMIT 1"
                ),
                params![user_id, channel],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    // ── Messages ───────────────────────────────────────────────────────

    pub fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&[ToolCall]>,
    ) -> EngineResult<i64> {
        self.append_message_row(session_id, role, content, tool_calls, None, None)
    }

    /// Full form for tool-role messages, which must keep their call linkage
    /// for faithful history replay.
    pub fn append_message_row(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&[ToolCall]>,
        tool_call_id: Option<&str>,
        name: Option<&str>,
    ) -> EngineResult<i64> {
        let conn = self.lock();
        let tool_calls_json = match tool_calls {
            Some(tc) if !tc.is_empty() => Some(serde_json::to_string(tc)?),
            _ => None,
        };
        conn.execute(
            "INSERT INTO messages (session_id, role, content, tool_calls, tool_call_id, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![session_id, role, content, tool_calls_json, tool_call_id, name, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The last `limit` messages in insertion order (oldest of the window
    /// first). Ordering is by rowid, not created_at.
    pub fn recent_messages(&self, session_id: &str, limit: usize) -> EngineResult<Vec<StoredMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, tool_calls, tool_call_id, name, created_at FROM (
                 SELECT * FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let messages = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    tool_calls_json: row.get(4)?,
                    tool_call_id: row.get(5)?,
                    name: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_open_session_per_user_channel() {
        let store = Store::open_in_memory().unwrap();
        let s1 = store.open_session("alice", "telegram").unwrap();
        assert_eq!(
            store.get_open_session("alice", "telegram").unwrap().unwrap().session_id,
            s1.session_id
        );
        assert!(store.get_open_session("alice", "whatsapp").unwrap().is_none());
    }

    #[test]
    fn end_session_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let s = store.open_session("alice", "api").unwrap();

        assert!(store.end_session(&s.session_id, "first summary", "token_limit").unwrap());
        assert!(!store.end_session(&s.session_id, "second summary", "manual").unwrap());

        let row = store.get_session(&s.session_id).unwrap().unwrap();
        assert_eq!(row.summary.as_deref(), Some("first summary"));
        assert_eq!(row.close_reason.as_deref(), Some("token_limit"));
    }

    #[test]
    fn messages_ordered_by_insertion() {
        let store = Store::open_in_memory().unwrap();
        let s = store.open_session("alice", "api").unwrap();
        for i in 0..5 {
            store.append_message(&s.session_id, "user", &format!("msg{i}"), None).unwrap();
        }
        let msgs = store.recent_messages(&s.session_id, 3).unwrap();
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg2", "msg3", "msg4"]);
    }

    #[test]
    fn token_accumulation() {
        let store = Store::open_in_memory().unwrap();
        let s = store.open_session("alice", "api").unwrap();
        assert_eq!(store.add_session_tokens(&s.session_id, 100).unwrap(), 100);
        assert_eq!(store.add_session_tokens(&s.session_id, 250).unwrap(), 350);
    }

    #[test]
    fn last_closed_session_surfaces_summary() {
        let store = Store::open_in_memory().unwrap();
        let s = store.open_session("alice", "api").unwrap();
        store.end_session(&s.session_id, "we talked about rust", "manual").unwrap();
        store.open_session("alice", "api").unwrap();

        let closed = store.last_closed_session("alice", "api").unwrap().unwrap();
        assert_eq!(closed.session_id, s.session_id);
        assert_eq!(closed.summary.as_deref(), Some("we talked about rust"));
    }
}
