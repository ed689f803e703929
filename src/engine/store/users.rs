use log::info;
use rusqlite::{params, OptionalExtension};

use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ChannelLink, User, UserRole};

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        password_hash: row.get(2)?,
        role: UserRole::parse(&row.get::<_, String>(3)?),
        created_at: row.get(4)?,
    })
}

impl Store {
    // ── User CRUD ──────────────────────────────────────────────────────

    pub fn get_user(&self, user_id: &str) -> EngineResult<Option<User>> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT user_id, display_name, password_hash, role, created_at
                 FROM users WHERE user_id = ?1",
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Fetch the user, creating a `member` row when absent.
    pub fn get_or_create_user(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> EngineResult<User> {
        if let Some(user) = self.get_user(user_id)? {
            return Ok(user);
        }
        let conn = self.lock();
        let created_at = now_rfc3339();
        let name = display_name.unwrap_or(user_id);
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id, display_name, role, created_at)
             VALUES (?1, ?2, 'member', ?3)",
            params![user_id, name, created_at],
        )?;
        info!("[store] Created user {}", user_id);
        Ok(User {
            user_id: user_id.to_string(),
            display_name: name.to_string(),
            password_hash: None,
            role: UserRole::Member,
            created_at,
        })
    }

    /// Role changes are owner-only; the caller enforces that.
    pub fn set_user_role(&self, user_id: &str, role: UserRole) -> EngineResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE users SET role = ?2 WHERE user_id = ?1",
            params![user_id, role.as_str()],
        )?;
        if changed == 0 {
            return Err(crate::atoms::error::EngineError::UserUnknown(user_id.to_string()));
        }
        Ok(())
    }

    /// Idempotently install the config-derived owner. Any previous owner row
    /// is demoted so exactly one owner exists afterwards.
    pub fn ensure_owner(&self, user_id: &str, display_name: &str) -> EngineResult<()> {
        self.get_or_create_user(user_id, Some(display_name))?;
        let conn = self.lock();
        conn.execute(
            "UPDATE users SET role = 'member' WHERE role = 'owner' AND user_id != ?1",
            params![user_id],
        )?;
        conn.execute("UPDATE users SET role = 'owner' WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    // ── Channel links ──────────────────────────────────────────────────

    pub fn link_channel(
        &self,
        user_id: &str,
        channel: &str,
        channel_address: &str,
        metadata: Option<&serde_json::Value>,
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO channel_links (user_id, channel, channel_address, metadata)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, channel, channel_address, metadata.map(|m| m.to_string())],
        )?;
        Ok(())
    }

    /// Resolve an external identity to a user id, if linked.
    pub fn resolve_channel(&self, channel: &str, channel_address: &str) -> EngineResult<Option<String>> {
        let conn = self.lock();
        let user_id = conn
            .query_row(
                "SELECT user_id FROM channel_links WHERE channel = ?1 AND channel_address = ?2",
                params![channel, channel_address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    pub fn channel_links_for_user(&self, user_id: &str) -> EngineResult<Vec<ChannelLink>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, channel, channel_address, metadata
             FROM channel_links WHERE user_id = ?1 ORDER BY channel",
        )?;
        let links = stmt
            .query_map(params![user_id], |row| {
                let metadata: Option<String> = row.get(3)?;
                Ok(ChannelLink {
                    user_id: row.get(0)?,
                    channel: row.get(1)?,
                    channel_address: row.get(2)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(links)
    }

    /// Find a user by display name, for messaging tools addressing people by
    /// name ("send it to Murat").
    pub fn find_user_by_name(&self, name: &str) -> EngineResult<Option<User>> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT user_id, display_name, password_hash, role, created_at
                 FROM users WHERE display_name = ?1 COLLATE NOCASE OR user_id = ?1",
                params![name],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let a = store.get_or_create_user("alice", Some("Alice")).unwrap();
        let b = store.get_or_create_user("alice", None).unwrap();
        assert_eq!(a.user_id, b.user_id);
        assert_eq!(b.display_name, "Alice");
        assert_eq!(b.role, UserRole::Member);
    }

    #[test]
    fn ensure_owner_keeps_exactly_one() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_owner("alice", "Alice").unwrap();
        store.ensure_owner("bob", "Bob").unwrap();

        let conn = store.lock();
        let owners: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE role = 'owner'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(owners, 1);
        let owner: String = conn
            .query_row("SELECT user_id FROM users WHERE role = 'owner'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(owner, "bob");
    }

    #[test]
    fn set_role_unknown_user_errors() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.set_user_role("ghost", UserRole::Guest).is_err());
    }

    #[test]
    fn channel_link_resolution() {
        let store = Store::open_in_memory().unwrap();
        store.get_or_create_user("alice", None).unwrap();
        store
            .link_channel("alice", "whatsapp", "+4915551234", Some(&serde_json::json!({"verified": true})))
            .unwrap();

        assert_eq!(
            store.resolve_channel("whatsapp", "+4915551234").unwrap().as_deref(),
            Some("alice")
        );
        assert!(store.resolve_channel("whatsapp", "+000").unwrap().is_none());

        // Re-linking the same address moves it to the new user.
        store.get_or_create_user("bob", None).unwrap();
        store.link_channel("bob", "whatsapp", "+4915551234", None).unwrap();
        assert_eq!(
            store.resolve_channel("whatsapp", "+4915551234").unwrap().as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn find_user_by_name_is_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store.get_or_create_user("murat", Some("Murat")).unwrap();
        let found = store.find_user_by_name("murat").unwrap().unwrap();
        assert_eq!(found.user_id, "murat");
        let found = store.find_user_by_name("MURAT").unwrap();
        assert!(found.is_some());
    }
}
