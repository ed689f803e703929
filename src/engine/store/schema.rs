// Database schema and migrations for the GraphBot store.
// Called once at startup by Store::open() after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN (errors silently swallowed) at the end
// of run_migrations() — never modify existing SQL to keep upgrade paths clean.

use rusqlite::Connection;

use crate::atoms::error::EngineResult;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Identity ─────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL DEFAULT '',
            password_hash TEXT,
            role TEXT NOT NULL DEFAULT 'member',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_links (
            user_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            channel_address TEXT NOT NULL,
            metadata TEXT,
            PRIMARY KEY (channel, channel_address),
            FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_channel_links_user
            ON channel_links(user_id);

        -- ═══ Sessions & messages ═══

        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            summary TEXT,
            token_count INTEGER NOT NULL DEFAULT 0,
            close_reason TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_open
            ON sessions(user_id, channel, ended_at);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            tool_calls TEXT,
            tool_call_id TEXT,
            name TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, id);

        -- ═══ Semantic user data ═══

        CREATE TABLE IF NOT EXISTS agent_memory (
            user_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );

        CREATE TABLE IF NOT EXISTS user_notes (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'conversation',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_user_notes_user
            ON user_notes(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS activity_log (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activity_user
            ON activity_log(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS favorites (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            label TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS preferences (
            user_id TEXT PRIMARY KEY,
            data TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL
        );

        -- ═══ Background execution ═══

        CREATE TABLE IF NOT EXISTS cron_jobs (
            job_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            cron_expr TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            channel TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            processor TEXT NOT NULL DEFAULT 'static',
            plan_json TEXT NOT NULL DEFAULT '{}',
            notify_condition TEXT NOT NULL DEFAULT 'always',
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cron_jobs_user ON cron_jobs(user_id);

        CREATE TABLE IF NOT EXISTS reminders (
            reminder_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            run_at TEXT NOT NULL,
            cron_expr TEXT,
            processor TEXT NOT NULL DEFAULT 'static',
            plan_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            sent_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_reminders_status
            ON reminders(status, run_at);

        CREATE TABLE IF NOT EXISTS background_tasks (
            task_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            parent_session TEXT,
            fallback_channel TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            plan_json TEXT NOT NULL DEFAULT '{}',
            result TEXT,
            error TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_background_tasks_user
            ON background_tasks(user_id, started_at DESC);

        CREATE TABLE IF NOT EXISTS system_events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            delivered_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_system_events_undelivered
            ON system_events(user_id, delivered_at);

        CREATE TABLE IF NOT EXISTS cron_execution_log (
            log_id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            executed_at TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_cron_log_job
            ON cron_execution_log(job_id, log_id DESC);

        -- ═══ Audit ═══

        CREATE TABLE IF NOT EXISTS api_keys (
            key_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            label TEXT NOT NULL DEFAULT '',
            key_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT
        );

        CREATE TABLE IF NOT EXISTS delegation_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            request TEXT NOT NULL,
            plan_json TEXT NOT NULL DEFAULT '{}',
            outcome TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
    ",
    )?;

    Ok(())
}
