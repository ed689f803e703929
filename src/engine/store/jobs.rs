use log::info;
use rusqlite::{params, OptionalExtension};

use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::plan::ExecutionPlan;
use crate::atoms::types::{BackgroundTask, CronExecution, CronJob, ExecStatus, Reminder, ReminderStatus};

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    Ok(CronJob {
        job_id: row.get(0)?,
        user_id: row.get(1)?,
        cron_expr: row.get(2)?,
        message: row.get(3)?,
        channel: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        processor: row.get(6)?,
        plan_json: row.get(7)?,
        notify_condition: row.get(8)?,
        consecutive_failures: row.get(9)?,
        created_at: row.get(10)?,
    })
}

const JOB_COLS: &str = "job_id, user_id, cron_expr, message, channel, enabled, processor, \
                        plan_json, notify_condition, consecutive_failures, created_at";

fn reminder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    Ok(Reminder {
        reminder_id: row.get(0)?,
        user_id: row.get(1)?,
        channel: row.get(2)?,
        run_at: row.get(3)?,
        cron_expr: row.get(4)?,
        processor: row.get(5)?,
        plan_json: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        sent_at: row.get(9)?,
    })
}

const REMINDER_COLS: &str = "reminder_id, user_id, channel, run_at, cron_expr, processor, \
                             plan_json, status, created_at, sent_at";

impl Store {
    // ── Cron jobs ──────────────────────────────────────────────────────

    pub fn create_cron_job(
        &self,
        user_id: &str,
        cron_expr: &str,
        channel: &str,
        plan: &ExecutionPlan,
    ) -> EngineResult<CronJob> {
        let conn = self.lock();
        let job_id = uuid::Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let message = plan.message.clone().unwrap_or_default();
        let plan_json = serde_json::to_string(plan)?;
        conn.execute(
            "INSERT INTO cron_jobs (job_id, user_id, cron_expr, message, channel, enabled,
                                    processor, plan_json, notify_condition, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9)",
            params![
                job_id,
                user_id,
                cron_expr,
                message,
                channel,
                plan.processor.as_str(),
                plan_json,
                plan.notify_condition.as_str(),
                created_at,
            ],
        )?;
        info!("[store] Created cron job {} ({})", job_id, cron_expr);
        Ok(CronJob {
            job_id,
            user_id: user_id.to_string(),
            cron_expr: cron_expr.to_string(),
            message,
            channel: channel.to_string(),
            enabled: true,
            processor: plan.processor.as_str().to_string(),
            plan_json,
            notify_condition: plan.notify_condition.as_str().to_string(),
            consecutive_failures: 0,
            created_at,
        })
    }

    pub fn get_cron_job(&self, job_id: &str) -> EngineResult<Option<CronJob>> {
        let conn = self.lock();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLS} FROM cron_jobs WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list_cron_jobs(&self, user_id: Option<&str>) -> EngineResult<Vec<CronJob>> {
        let conn = self.lock();
        let mut jobs = Vec::new();
        match user_id {
            Some(uid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLS} FROM cron_jobs WHERE user_id = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map(params![uid], job_from_row)?;
                jobs.extend(rows.filter_map(|r| r.ok()));
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {JOB_COLS} FROM cron_jobs ORDER BY created_at"))?;
                let rows = stmt.query_map([], job_from_row)?;
                jobs.extend(rows.filter_map(|r| r.ok()));
            }
        }
        Ok(jobs)
    }

    pub fn enabled_cron_jobs(&self) -> EngineResult<Vec<CronJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLS} FROM cron_jobs WHERE enabled = 1 ORDER BY created_at"
        ))?;
        let jobs = stmt.query_map([], job_from_row)?.filter_map(|r| r.ok()).collect();
        Ok(jobs)
    }

    pub fn set_job_enabled(&self, job_id: &str, enabled: bool) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE cron_jobs SET enabled = ?2 WHERE job_id = ?1",
            params![job_id, enabled as i64],
        )?;
        Ok(())
    }

    pub fn delete_cron_job(&self, job_id: &str) -> EngineResult<bool> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM cron_jobs WHERE job_id = ?1", params![job_id])?;
        Ok(changed > 0)
    }

    /// Bump the consecutive-failure counter; returns the new count so the
    /// scheduler can decide on auto-pause.
    pub fn increment_failures(&self, job_id: &str) -> EngineResult<i64> {
        let conn = self.lock();
        conn.execute(
            "UPDATE cron_jobs SET consecutive_failures = consecutive_failures + 1 WHERE job_id = ?1",
            params![job_id],
        )?;
        let count = conn.query_row(
            "SELECT consecutive_failures FROM cron_jobs WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn reset_failures(&self, job_id: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE cron_jobs SET consecutive_failures = 0 WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(())
    }

    // ── Execution log ──────────────────────────────────────────────────

    pub fn log_execution(
        &self,
        job_id: &str,
        status: ExecStatus,
        result: Option<&str>,
        duration_ms: i64,
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO cron_execution_log (job_id, executed_at, status, result, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, now_rfc3339(), status.as_str(), result, duration_ms],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_executions(&self, job_id: &str, limit: usize) -> EngineResult<Vec<CronExecution>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT log_id, job_id, executed_at, status, result, duration_ms
             FROM cron_execution_log WHERE job_id = ?1 ORDER BY log_id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], |row| {
                Ok(CronExecution {
                    log_id: row.get(0)?,
                    job_id: row.get(1)?,
                    executed_at: row.get(2)?,
                    status: row.get(3)?,
                    result: row.get(4)?,
                    duration_ms: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Reminders ──────────────────────────────────────────────────────

    pub fn create_reminder(
        &self,
        user_id: &str,
        channel: &str,
        run_at: &str,
        cron_expr: Option<&str>,
        plan: &ExecutionPlan,
    ) -> EngineResult<Reminder> {
        let conn = self.lock();
        let reminder_id = uuid::Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let plan_json = serde_json::to_string(plan)?;
        conn.execute(
            "INSERT INTO reminders (reminder_id, user_id, channel, run_at, cron_expr,
                                    processor, plan_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                reminder_id,
                user_id,
                channel,
                run_at,
                cron_expr,
                plan.processor.as_str(),
                plan_json,
                created_at,
            ],
        )?;
        Ok(Reminder {
            reminder_id,
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            run_at: run_at.to_string(),
            cron_expr: cron_expr.map(|c| c.to_string()),
            processor: plan.processor.as_str().to_string(),
            plan_json,
            status: "pending".to_string(),
            created_at,
            sent_at: None,
        })
    }

    pub fn get_reminder(&self, reminder_id: &str) -> EngineResult<Option<Reminder>> {
        let conn = self.lock();
        let reminder = conn
            .query_row(
                &format!("SELECT {REMINDER_COLS} FROM reminders WHERE reminder_id = ?1"),
                params![reminder_id],
                reminder_from_row,
            )
            .optional()?;
        Ok(reminder)
    }

    pub fn list_reminders(&self, user_id: Option<&str>) -> EngineResult<Vec<Reminder>> {
        let conn = self.lock();
        let mut out = Vec::new();
        match user_id {
            Some(uid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REMINDER_COLS} FROM reminders WHERE user_id = ?1 ORDER BY run_at"
                ))?;
                let rows = stmt.query_map(params![uid], reminder_from_row)?;
                out.extend(rows.filter_map(|r| r.ok()));
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {REMINDER_COLS} FROM reminders ORDER BY run_at"))?;
                let rows = stmt.query_map([], reminder_from_row)?;
                out.extend(rows.filter_map(|r| r.ok()));
            }
        }
        Ok(out)
    }

    pub fn pending_reminders(&self) -> EngineResult<Vec<Reminder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REMINDER_COLS} FROM reminders WHERE status = 'pending' ORDER BY run_at"
        ))?;
        let rows = stmt.query_map([], reminder_from_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    /// One-shot transition; recurring reminders stay pending and only update
    /// `run_at` to the next fire time.
    pub fn set_reminder_status(&self, reminder_id: &str, status: ReminderStatus) -> EngineResult<()> {
        let conn = self.lock();
        let sent_at = match status {
            ReminderStatus::Sent => Some(now_rfc3339()),
            _ => None,
        };
        conn.execute(
            "UPDATE reminders SET status = ?2, sent_at = COALESCE(?3, sent_at) WHERE reminder_id = ?1",
            params![reminder_id, status.as_str(), sent_at],
        )?;
        Ok(())
    }

    pub fn set_reminder_run_at(&self, reminder_id: &str, run_at: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE reminders SET run_at = ?2 WHERE reminder_id = ?1",
            params![reminder_id, run_at],
        )?;
        Ok(())
    }

    // ── Background tasks ───────────────────────────────────────────────

    pub fn create_background_task(
        &self,
        user_id: &str,
        parent_session: Option<&str>,
        fallback_channel: &str,
        plan: &ExecutionPlan,
    ) -> EngineResult<String> {
        let conn = self.lock();
        let task_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO background_tasks (task_id, user_id, parent_session, fallback_channel,
                                           status, plan_json, started_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
            params![
                task_id,
                user_id,
                parent_session,
                fallback_channel,
                serde_json::to_string(plan)?,
                now_rfc3339(),
            ],
        )?;
        Ok(task_id)
    }

    pub fn complete_background_task(
        &self,
        task_id: &str,
        result: Result<&str, &str>,
    ) -> EngineResult<()> {
        let conn = self.lock();
        match result {
            Ok(output) => conn.execute(
                "UPDATE background_tasks SET status = 'completed', result = ?2, completed_at = ?3
                 WHERE task_id = ?1",
                params![task_id, output, now_rfc3339()],
            )?,
            Err(err) => conn.execute(
                "UPDATE background_tasks SET status = 'failed', error = ?2, completed_at = ?3
                 WHERE task_id = ?1",
                params![task_id, err, now_rfc3339()],
            )?,
        };
        Ok(())
    }

    pub fn get_background_task(&self, task_id: &str) -> EngineResult<Option<BackgroundTask>> {
        let conn = self.lock();
        let task = conn
            .query_row(
                "SELECT task_id, user_id, parent_session, fallback_channel, status, plan_json,
                        result, error, started_at, completed_at
                 FROM background_tasks WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(BackgroundTask {
                        task_id: row.get(0)?,
                        user_id: row.get(1)?,
                        parent_session: row.get(2)?,
                        fallback_channel: row.get(3)?,
                        status: row.get(4)?,
                        plan_json: row.get(5)?,
                        result: row.get(6)?,
                        error: row.get(7)?,
                        started_at: row.get(8)?,
                        completed_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(task)
    }
}
