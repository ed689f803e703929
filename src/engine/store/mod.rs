// GraphBot Engine — Durable Store
// Single source of truth for users, sessions, memory, jobs, and events.
// SQLite via rusqlite with WAL enabled; one connection behind a Mutex —
// concurrent turns serialize their writes at the connection, and ordering
// within a session comes from the messages rowid, not wall-clock time.
//
// Module layout:
//   users     — user CRUD, roles, channel links
//   sessions  — session lifecycle (open / conditional close) + messages
//   memory    — notes, preferences, favorites, activity, agent memory
//   jobs      — cron jobs, reminders, background tasks, execution log
//   events    — system event queue + api keys + delegation audit

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::atoms::error::EngineResult;

mod events;
mod jobs;
mod memory;
mod schema;
mod sessions;
mod users;

/// Default on-disk location: `<data_dir>/graphbot/graphbot.db`.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("graphbot")
        .join("graphbot.db")
}

/// Thread-safe database wrapper.
pub struct Store {
    /// The SQLite connection, protected by a Mutex.
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        schema::run_migrations(&conn)?;
        log::info!("[store] Opened {}", path.display());
        Ok(Store { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Current UTC instant as the store's canonical timestamp format.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
