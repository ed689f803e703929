// GraphBot Engine — Scheduler
// Persistent cron and one-shot triggers. One owner task holds the in-memory
// trigger table; external mutators (add/cancel/list) write store rows and
// post a refresh command through the queue instead of touching the table.
// Triggers due in the same tick run serialized, in table order; their
// relative order is unspecified by contract.
//
// Failure policy: every firing appends a cron_execution_log row. Three
// consecutive errors auto-pause the job; one success resets the counter.
// One-shot reminders go pending → sent | failed and are never retried;
// recurring reminders (cron_expr set) stay pending forever.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::atoms::constants::{JOB_AUTO_PAUSE_THRESHOLD, SCHEDULER_TICK_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::plan::{ExecutionPlan, NotifyCondition, ProcessorKind};
use crate::atoms::types::{CronJob, ExecStatus, Reminder, ReminderStatus};
use crate::engine::dispatch::Dispatcher;
use crate::engine::events::EventBus;
use crate::engine::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Job,
    Reminder,
}

enum Command {
    Refresh,
    /// Run one tick immediately; ack when the tick (and its firings) finish.
    TickNow(oneshot::Sender<()>),
    Shutdown,
}

/// Five-field cron (minute hour day month weekday), normalized to the
/// six-field form the parser wants.
pub fn parse_cron(expr: &str) -> EngineResult<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 { format!("0 {expr}") } else { expr.to_string() };
    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::Schedule(format!("bad cron '{expr}': {e}")))
}

pub fn next_fire(expr: &str, after: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
    parse_cron(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| EngineError::Schedule(format!("cron '{expr}' has no future firings")))
}

// ── Handle (the mutator side) ──────────────────────────────────────────────

#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<Store>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    pub fn add_job(
        &self,
        user_id: &str,
        cron_expr: &str,
        plan: &ExecutionPlan,
        channel: &str,
    ) -> EngineResult<String> {
        parse_cron(cron_expr)?; // reject bad expressions before persisting
        let job = self.store.create_cron_job(user_id, cron_expr, channel, plan)?;
        self.refresh();
        Ok(job.job_id)
    }

    pub fn add_delayed_reminder(
        &self,
        user_id: &str,
        delay_seconds: i64,
        plan: &ExecutionPlan,
        channel: &str,
    ) -> EngineResult<String> {
        let run_at = (Utc::now() + chrono::Duration::seconds(delay_seconds.max(0))).to_rfc3339();
        let reminder = self.store.create_reminder(user_id, channel, &run_at, None, plan)?;
        self.refresh();
        Ok(reminder.reminder_id)
    }

    pub fn add_recurring_reminder(
        &self,
        user_id: &str,
        cron_expr: &str,
        plan: &ExecutionPlan,
        channel: &str,
    ) -> EngineResult<String> {
        let first = next_fire(cron_expr, Utc::now())?;
        let reminder =
            self.store
                .create_reminder(user_id, channel, &first.to_rfc3339(), Some(cron_expr), plan)?;
        self.refresh();
        Ok(reminder.reminder_id)
    }

    /// Remove a trigger. An in-flight firing is not interrupted.
    pub fn cancel(&self, kind: TriggerKind, id: &str) -> EngineResult<bool> {
        let found = match kind {
            TriggerKind::Job => self.store.delete_cron_job(id)?,
            TriggerKind::Reminder => match self.store.get_reminder(id)? {
                Some(r) if r.status == "pending" => {
                    self.store.set_reminder_status(id, ReminderStatus::Cancelled)?;
                    true
                }
                _ => false,
            },
        };
        if found {
            self.refresh();
        }
        Ok(found)
    }

    pub fn list(&self, user_id: &str) -> EngineResult<(Vec<CronJob>, Vec<Reminder>)> {
        Ok((self.store.list_cron_jobs(Some(user_id))?, self.store.list_reminders(Some(user_id))?))
    }

    /// Force one tick and wait for it to complete. Test hook, also handy
    /// for hosts that want a flush on shutdown.
    pub async fn kick(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::TickNow(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn refresh(&self) {
        let _ = self.tx.send(Command::Refresh);
    }
}

// ── Owner task ─────────────────────────────────────────────────────────────

struct Trigger {
    kind: TriggerKind,
    id: String,
    user_id: String,
    channel: String,
    plan: ExecutionPlan,
    /// None for one-shot reminders.
    cron_expr: Option<String>,
    next_fire: DateTime<Utc>,
    notify: NotifyCondition,
}

pub struct Scheduler {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventBus>,
    triggers: Vec<Trigger>,
}

impl Scheduler {
    /// Rehydrate enabled rows and start the owner task.
    pub fn start(
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<EventBus>,
    ) -> SchedulerHandle {
        Self::start_with_tick(store, dispatcher, events, Duration::from_secs(SCHEDULER_TICK_SECS))
    }

    pub fn start_with_tick(
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<EventBus>,
        tick: Duration,
    ) -> SchedulerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle { store: store.clone(), tx };

        let mut scheduler = Scheduler { store, dispatcher, events, triggers: Vec::new() };
        tokio::spawn(async move {
            if let Err(e) = scheduler.reload() {
                error!("[scheduler] Initial load failed: {}", e);
            }
            info!("[scheduler] Started with {} trigger(s)", scheduler.triggers.len());
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.tick(Utc::now()).await,
                    cmd = rx.recv() => match cmd {
                        Some(Command::Refresh) => {
                            if let Err(e) = scheduler.reload() {
                                error!("[scheduler] Reload failed: {}", e);
                            }
                        }
                        Some(Command::TickNow(ack)) => {
                            scheduler.tick(Utc::now()).await;
                            let _ = ack.send(());
                        }
                        Some(Command::Shutdown) | None => {
                            info!("[scheduler] Shutting down");
                            break;
                        }
                    },
                }
            }
        });

        handle
    }

    /// Rebuild the trigger table from the store. Rows with unparseable cron
    /// expressions are skipped with a warning rather than wedging the loop.
    fn reload(&mut self) -> EngineResult<()> {
        let mut triggers = Vec::new();
        let now = Utc::now();

        for job in self.store.enabled_cron_jobs()? {
            let plan: ExecutionPlan = match serde_json::from_str(&job.plan_json) {
                Ok(p) => p,
                Err(e) => {
                    warn!("[scheduler] Job {} has bad plan_json: {}", job.job_id, e);
                    continue;
                }
            };
            match next_fire(&job.cron_expr, now) {
                Ok(fire) => triggers.push(Trigger {
                    kind: TriggerKind::Job,
                    id: job.job_id,
                    user_id: job.user_id,
                    channel: job.channel,
                    notify: if job.notify_condition == "notify_skip" {
                        NotifyCondition::NotifySkip
                    } else {
                        NotifyCondition::Always
                    },
                    plan,
                    cron_expr: Some(job.cron_expr),
                    next_fire: fire,
                }),
                Err(e) => warn!("[scheduler] Job {}: {}", job.job_id, e),
            }
        }

        for reminder in self.store.pending_reminders()? {
            let plan: ExecutionPlan = match serde_json::from_str(&reminder.plan_json) {
                Ok(p) => p,
                Err(e) => {
                    warn!("[scheduler] Reminder {} has bad plan_json: {}", reminder.reminder_id, e);
                    continue;
                }
            };
            let run_at = match DateTime::parse_from_rfc3339(&reminder.run_at) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    warn!("[scheduler] Reminder {} has bad run_at: {}", reminder.reminder_id, e);
                    continue;
                }
            };
            let notify = plan.notify_condition;
            triggers.push(Trigger {
                kind: TriggerKind::Reminder,
                id: reminder.reminder_id,
                user_id: reminder.user_id,
                channel: reminder.channel,
                plan,
                cron_expr: reminder.cron_expr,
                next_fire: run_at,
                notify,
            });
        }

        self.triggers = triggers;
        Ok(())
    }

    /// Fire everything due, serialized in table order. Each trigger is
    /// isolated — one failure never affects another. Due triggers are
    /// drained out of the table, fired, and re-inserted unless retired.
    async fn tick(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<Trigger> = Vec::new();
        let mut i = 0;
        while i < self.triggers.len() {
            if self.triggers[i].next_fire <= now {
                due.push(self.triggers.remove(i));
            } else {
                i += 1;
            }
        }

        for mut trigger in due {
            let retire = self.fire(&trigger).await;
            let one_shot = trigger.kind == TriggerKind::Reminder && trigger.cron_expr.is_none();
            if retire || one_shot {
                continue;
            }
            let Some(expr) = trigger.cron_expr.clone() else { continue };
            match next_fire(&expr, now) {
                Ok(fire) => {
                    trigger.next_fire = fire;
                    if trigger.kind == TriggerKind::Reminder {
                        if let Err(e) =
                            self.store.set_reminder_run_at(&trigger.id, &fire.to_rfc3339())
                        {
                            warn!("[scheduler] Could not advance reminder {}: {}", trigger.id, e);
                        }
                    }
                    self.triggers.push(trigger);
                }
                Err(e) => warn!("[scheduler] Retiring trigger {}: {}", trigger.id, e),
            }
        }
    }

    /// Returns true when the trigger must not be re-armed (auto-paused).
    async fn fire(&self, trigger: &Trigger) -> bool {
        info!("[scheduler] Firing {:?} {} for {}", trigger.kind, trigger.id, trigger.user_id);
        let started = Instant::now();
        let result = self
            .dispatcher
            .dispatch(&trigger.user_id, &trigger.channel, &trigger.plan)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match trigger.kind {
            TriggerKind::Job => self.finish_job(trigger, result, duration_ms).await,
            TriggerKind::Reminder => {
                self.finish_reminder(trigger, result).await;
                false
            }
        }
    }

    async fn finish_job(
        &self,
        trigger: &Trigger,
        result: EngineResult<crate::engine::dispatch::DispatchOutcome>,
        duration_ms: i64,
    ) -> bool {
        let job_id = &trigger.id;
        match result {
            Ok(outcome) => {
                if let Err(e) = self.store.log_execution(
                    job_id,
                    outcome.status,
                    outcome.detail.as_deref(),
                    duration_ms,
                ) {
                    warn!("[scheduler] Could not log execution for {}: {}", job_id, e);
                }
                if outcome.status == ExecStatus::Success {
                    self.store.reset_failures(job_id).ok();
                    // The static processor is the one case where the
                    // scheduler itself delivered; queue the result so the
                    // next session turn sees it too.
                    if trigger.plan.processor == ProcessorKind::Static
                        && trigger.notify == NotifyCondition::Always
                    {
                        self.events
                            .emit(
                                &trigger.user_id,
                                "schedule_result",
                                &serde_json::json!({
                                    "job_id": job_id,
                                    "text": outcome.detail,
                                }),
                            )
                            .ok();
                    }
                }
                false
            }
            Err(e) => {
                error!("[scheduler] Job {} failed: {}", job_id, e);
                self.store
                    .log_execution(job_id, ExecStatus::Error, Some(&e.to_string()), duration_ms)
                    .ok();
                if trigger.notify == NotifyCondition::Always {
                    self.dispatcher
                        .notify_failure(&trigger.user_id, &trigger.channel, &e.to_string())
                        .await;
                }
                let failures = self.store.increment_failures(job_id).unwrap_or(0);
                if failures >= JOB_AUTO_PAUSE_THRESHOLD {
                    warn!("[scheduler] Auto-pausing job {} after {} failures", job_id, failures);
                    self.store.set_job_enabled(job_id, false).ok();
                    return true;
                }
                false
            }
        }
    }

    async fn finish_reminder(
        &self,
        trigger: &Trigger,
        result: EngineResult<crate::engine::dispatch::DispatchOutcome>,
    ) {
        let reminder_id = &trigger.id;
        let recurring = trigger.cron_expr.is_some();
        match result {
            Ok(_) if recurring => {} // stays pending
            Ok(_) => {
                self.store.set_reminder_status(reminder_id, ReminderStatus::Sent).ok();
                // Same rule as jobs: only the static processor had the
                // scheduler deliver, so only it queues a result event.
                // Function and agent processors own their side effects.
                if trigger.plan.processor == ProcessorKind::Static
                    && trigger.notify == NotifyCondition::Always
                {
                    self.events
                        .emit(
                            &trigger.user_id,
                            "reminder_sent",
                            &serde_json::json!({"reminder_id": reminder_id}),
                        )
                        .ok();
                }
            }
            Err(e) => {
                error!("[scheduler] Reminder {} failed: {}", reminder_id, e);
                if trigger.notify == NotifyCondition::Always {
                    self.dispatcher
                        .notify_failure(&trigger.user_id, &trigger.channel, &e.to_string())
                        .await;
                }
                if !recurring {
                    self.store.set_reminder_status(reminder_id, ReminderStatus::Failed).ok();
                }
            }
        }
    }
}
