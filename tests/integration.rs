// GraphBot integration tests — one binary, teacher-style, exercising the
// full stack: store + channels + tools + planner + scheduler + worker +
// runner, with a scripted mock provider and recording channel adapters.

use std::sync::Arc;
use std::time::Duration;

use graphbot::atoms::plan::{ExecutionKind, ExecutionPlan, NotifyCondition, ProcessorKind};
use graphbot::atoms::types::{ExecStatus, UserRole};
use graphbot::engine::channels::testing::RecordingAdapter;
use graphbot::engine::channels::ChannelRegistry;
use graphbot::engine::config::Config;
use graphbot::engine::context::ContextBuilder;
use graphbot::engine::delegation::DelegationPlanner;
use graphbot::engine::dispatch::Dispatcher;
use graphbot::engine::events::EventBus;
use graphbot::engine::permissions::Permissions;
use graphbot::engine::providers::mock::{MockProvider, Script};
use graphbot::engine::providers::AnyProvider;
use graphbot::engine::runner::GraphRunner;
use graphbot::engine::scheduler::{Scheduler, SchedulerHandle, TriggerKind};
use graphbot::engine::store::Store;
use graphbot::engine::tools::ToolRegistry;
use graphbot::engine::worker::SubagentWorker;

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<Store>,
    channels: Arc<ChannelRegistry>,
    whatsapp: Arc<RecordingAdapter>,
    telegram: Arc<RecordingAdapter>,
    scheduler: SchedulerHandle,
    worker: Arc<SubagentWorker>,
    provider: Arc<MockProvider>,
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
}

fn harness(scripts: Vec<Script>) -> Harness {
    harness_with_config(scripts, Config::default())
}

fn harness_with_config(scripts: Vec<Script>, mut config: Config) -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    // Config-derived owner, installed the way a host does at startup.
    config.assistant.owner.username = "alice".into();
    store.ensure_owner("alice", "Alice").unwrap();
    store.get_or_create_user("murat", Some("Murat")).unwrap();
    store.link_channel("alice", "whatsapp", "+49-alice", None).unwrap();
    store.link_channel("alice", "telegram", "tg-alice", None).unwrap();
    store.link_channel("murat", "whatsapp", "+90-murat", None).unwrap();

    let config = Arc::new(config);
    let channels = Arc::new(ChannelRegistry::new(store.clone(), &config.channels.prefix));
    let whatsapp = Arc::new(RecordingAdapter::new("whatsapp", true));
    let telegram = Arc::new(RecordingAdapter::new("telegram", false));
    channels.register(whatsapp.clone());
    channels.register(telegram.clone());

    let registry = Arc::new(ToolRegistry::with_builtins());
    let provider = Arc::new(MockProvider::new(scripts));
    let any = AnyProvider::from_provider(provider.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        channels.clone(),
        registry.clone(),
        any,
        config.clone(),
    ));
    let events = Arc::new(EventBus::new(store.clone()));
    let scheduler = Scheduler::start_with_tick(
        store.clone(),
        dispatcher.clone(),
        events.clone(),
        Duration::from_millis(100),
    );
    let worker = Arc::new(SubagentWorker::new(store.clone(), dispatcher, events));

    Harness { store, channels, whatsapp, telegram, scheduler, worker, provider, config, registry }
}

impl Harness {
    fn runner(&self) -> GraphRunner {
        self.runner_with_permissions(Permissions::open())
    }

    fn runner_with_permissions(&self, permissions: Permissions) -> GraphRunner {
        let context = Arc::new(
            ContextBuilder::new(self.store.clone()).with_identity("You are GraphBot.", None),
        );
        let planner = Arc::new(DelegationPlanner::new(
            AnyProvider::from_provider(self.provider.clone()),
            &self.registry,
            "mock-model",
            0.0,
        ));
        GraphRunner::new(
            self.store.clone(),
            AnyProvider::from_provider(self.provider.clone()),
            self.registry.clone(),
            Arc::new(permissions),
            self.channels.clone(),
            context,
            self.config.clone(),
        )
        .with_scheduler(self.scheduler.clone())
        .with_worker(self.worker.clone())
        .with_planner(planner)
    }
}

fn static_plan(execution: ExecutionKind, message: &str) -> ExecutionPlan {
    ExecutionPlan {
        execution,
        processor: ProcessorKind::Static,
        delay_seconds: None,
        cron_expr: None,
        notify_condition: NotifyCondition::Always,
        channel: None,
        message: Some(message.into()),
        tool_name: None,
        tool_args: None,
        prompt: None,
        tools: None,
        model: None,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ── Scenario 1: static delayed reminder ────────────────────────────────────

#[tokio::test]
async fn static_delayed_reminder_delivers_exactly_once() {
    let h = harness(vec![]);
    let plan = {
        let mut p = static_plan(ExecutionKind::Delayed, "Toplantı hatırlatma!");
        p.delay_seconds = Some(0);
        p
    };

    let id = h.scheduler.add_delayed_reminder("alice", 0, &plan, "whatsapp").unwrap();
    settle().await;
    h.scheduler.kick().await;

    // Exactly one message, bot-prefixed on the shared-identity transport.
    assert_eq!(h.whatsapp.messages(), vec!["[gbot] Toplantı hatırlatma!"]);
    let reminder = h.store.get_reminder(&id).unwrap().unwrap();
    assert_eq!(reminder.status, "sent");
    assert!(reminder.sent_at.is_some());

    // Static delivery also queues the result for the next session turn.
    assert!(h
        .store
        .undelivered_events("alice")
        .unwrap()
        .iter()
        .any(|e| e.kind == "reminder_sent"));

    // A later tick must not fire it again.
    h.scheduler.kick().await;
    assert_eq!(h.whatsapp.messages().len(), 1);
}

// ── Scenario 2: function delayed ───────────────────────────────────────────

#[tokio::test]
async fn function_reminder_tool_is_entire_side_effect() {
    let h = harness(vec![]);
    let plan = ExecutionPlan {
        execution: ExecutionKind::Delayed,
        processor: ProcessorKind::Function,
        delay_seconds: Some(0),
        cron_expr: None,
        notify_condition: NotifyCondition::Always,
        channel: None,
        message: None,
        tool_name: Some("send_message_to_user".into()),
        tool_args: Some(serde_json::json!({"target_user": "Murat", "message": "naber"})),
        prompt: None,
        tools: None,
        model: None,
    };

    let id = h.scheduler.add_delayed_reminder("alice", 0, &plan, "whatsapp").unwrap();
    settle().await;
    h.scheduler.kick().await;

    // The tool sent exactly one message to Murat; the scheduler added none.
    let sent = h.whatsapp.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+90-murat");
    assert_eq!(sent[0].1, "[gbot] naber");
    assert_eq!(h.store.get_reminder(&id).unwrap().unwrap().status, "sent");

    // The tool was the entire side effect — no confirmation event either,
    // so the originating user hears nothing beyond the delegation ack.
    assert!(h.store.undelivered_events("alice").unwrap().is_empty());
}

#[tokio::test]
async fn failed_reminder_notifies_when_condition_is_always() {
    let h = harness(vec![]);
    // delegate_task exists but sits outside the background-safe set, so
    // every firing errors.
    let plan = ExecutionPlan {
        execution: ExecutionKind::Delayed,
        processor: ProcessorKind::Function,
        delay_seconds: Some(0),
        cron_expr: None,
        notify_condition: NotifyCondition::Always,
        channel: None,
        message: None,
        tool_name: Some("delegate_task".into()),
        tool_args: Some(serde_json::json!({})),
        prompt: None,
        tools: None,
        model: None,
    };

    let id = h.scheduler.add_delayed_reminder("alice", 0, &plan, "telegram").unwrap();
    settle().await;
    h.scheduler.kick().await;

    assert_eq!(h.store.get_reminder(&id).unwrap().unwrap().status, "failed");
    let sent = h.telegram.messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("A scheduled task failed"));
}

// ── Scenario 3: agent delayed, cross-channel delivery by the agent ─────────

#[tokio::test]
async fn agent_reminder_owns_delivery() {
    let h = harness(vec![
        Script::ToolCalls(
            vec![(
                "send_message_to_user".into(),
                serde_json::json!({
                    "target_user": "Murat",
                    "channel": "whatsapp",
                    "message": "Hava güneşli, 24°C"
                }),
            )],
            String::new(),
        ),
        Script::Text("Done, I messaged Murat.".into()),
    ]);
    let plan = ExecutionPlan {
        execution: ExecutionKind::Delayed,
        processor: ProcessorKind::Agent,
        delay_seconds: Some(0),
        cron_expr: None,
        notify_condition: NotifyCondition::Always,
        channel: Some("whatsapp".into()),
        message: None,
        tool_name: None,
        tool_args: None,
        prompt: Some("Send the weather to Murat on whatsapp.".into()),
        tools: Some(vec!["send_message_to_user".into()]),
        model: None,
    };

    h.scheduler.add_delayed_reminder("alice", 0, &plan, "whatsapp").unwrap();
    settle().await;
    h.scheduler.kick().await;

    // Exactly one WhatsApp message to Murat — from the agent, not the
    // scheduler.
    let sent = h.whatsapp.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+90-murat");
    assert!(sent[0].1.contains("24°C"));
}

// ── Scenario 4: monitor with skip marker ───────────────────────────────────

#[tokio::test]
async fn monitor_skip_logs_skipped_and_sends_nothing() {
    // Several firings may land inside the test window; every one skips.
    let h = harness(
        (0..5).map(|_| Script::Text("[SKIP] price below threshold".into())).collect(),
    );
    let plan = ExecutionPlan {
        execution: ExecutionKind::Monitor,
        processor: ProcessorKind::Agent,
        delay_seconds: None,
        cron_expr: Some("* * * * * *".into()), // every second, for the test
        notify_condition: NotifyCondition::NotifySkip,
        channel: None,
        message: None,
        tool_name: None,
        tool_args: None,
        prompt: Some("Check gold; reply [SKIP] when below 3000 TL.".into()),
        tools: Some(vec!["send_message_to_user".into()]),
        model: None,
    };

    let job_id = h.scheduler.add_job("alice", "* * * * * *", &plan, "whatsapp").unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.scheduler.kick().await;
    h.scheduler.cancel(TriggerKind::Job, &job_id).unwrap();

    assert!(h.whatsapp.messages().is_empty());
    let log = h.store.recent_executions(&job_id, 10).unwrap();
    assert!(!log.is_empty());
    assert!(log.iter().all(|e| e.status == ExecStatus::Skipped.as_str()));
    // Skips are not failures.
    // (Job row is gone after cancel; the log rows remain.)
}

#[tokio::test]
async fn monitor_alert_delivers_via_agent_only() {
    let h = harness(vec![
        Script::ToolCalls(
            vec![(
                "send_message_to_user".into(),
                serde_json::json!({"message": "Altın 3050 TL'yi geçti!"}),
            )],
            String::new(),
        ),
        Script::Text("alerted".into()),
    ]);
    let plan = ExecutionPlan {
        execution: ExecutionKind::Monitor,
        processor: ProcessorKind::Agent,
        delay_seconds: None,
        cron_expr: Some("* * * * * *".into()),
        notify_condition: NotifyCondition::NotifySkip,
        channel: None,
        message: None,
        tool_name: None,
        tool_args: None,
        prompt: Some("Alert when gold passes 3000 TL.".into()),
        tools: Some(vec!["send_message_to_user".into()]),
        model: None,
    };

    let job_id = h.scheduler.add_job("alice", "* * * * * *", &plan, "whatsapp").unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.scheduler.kick().await;
    h.scheduler.cancel(TriggerKind::Job, &job_id).unwrap();

    let sent = h.whatsapp.messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("3050"));
    let log = h.store.recent_executions(&job_id, 10).unwrap();
    assert_eq!(log[0].status, ExecStatus::Success.as_str());
}

// ── Recurring reminders never leave pending ────────────────────────────────

#[tokio::test]
async fn recurring_reminder_stays_pending_across_firings() {
    let h = harness(vec![]);
    let plan = {
        let mut p = static_plan(ExecutionKind::Recurring, "günaydın!");
        p.cron_expr = Some("* * * * * *".into());
        p
    };

    let id = h
        .scheduler
        .add_recurring_reminder("alice", "* * * * * *", &plan, "telegram")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.scheduler.kick().await;

    assert!(!h.telegram.messages().is_empty());
    let reminder = h.store.get_reminder(&id).unwrap().unwrap();
    assert_eq!(reminder.status, "pending");
    assert!(reminder.sent_at.is_none());

    h.scheduler.cancel(TriggerKind::Reminder, &id).unwrap();
    assert_eq!(h.store.get_reminder(&id).unwrap().unwrap().status, "cancelled");
}

// ── Failure pausing ────────────────────────────────────────────────────────

#[tokio::test]
async fn three_consecutive_errors_auto_pause_job() {
    let h = harness(vec![]);
    // Function plan naming a tool outside the background-safe set: every
    // firing is an error.
    let plan = ExecutionPlan {
        execution: ExecutionKind::Recurring,
        processor: ProcessorKind::Function,
        delay_seconds: None,
        cron_expr: Some("* * * * * *".into()),
        notify_condition: NotifyCondition::NotifySkip, // silent: no failure spam
        channel: None,
        message: None,
        tool_name: Some("delegate_task".into()),
        tool_args: Some(serde_json::json!({})),
        prompt: None,
        tools: None,
        model: None,
    };
    let job_id = h.scheduler.add_job("alice", "* * * * * *", &plan, "telegram").unwrap();

    // Wait until the scheduler has fired enough to pause the job.
    let mut paused = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.scheduler.kick().await;
        let job = h.store.get_cron_job(&job_id).unwrap().unwrap();
        if !job.enabled {
            paused = true;
            break;
        }
    }
    assert!(paused, "job should auto-pause after three consecutive errors");

    let job = h.store.get_cron_job(&job_id).unwrap().unwrap();
    assert!(job.consecutive_failures >= 3);
    let log = h.store.recent_executions(&job_id, 10).unwrap();
    let newest_errors = log.iter().take(3).filter(|e| e.status == "error").count();
    assert_eq!(newest_errors, 3);

    // Paused job stops firing.
    let fired = log.len();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.scheduler.kick().await;
    assert_eq!(h.store.recent_executions(&job_id, 20).unwrap().len(), fired);
}

// ── Scenario 5: session rotation end-to-end ────────────────────────────────

#[tokio::test]
async fn session_rotation_summarizes_and_extracts() {
    let mut config = Config::default();
    config.assistant.session_token_limit = 15; // one mock turn (20) crosses it
    let h = harness_with_config(
        vec![
            Script::Text("İlk cevap".into()),
            Script::Text("Konuştuk: kullanıcı kahve seviyor.".into()), // summarize
            Script::Text(
                r#"{"preferences": [{"key": "drink", "value": "kahve"}], "notes": ["prefers morning meetings"]}"#
                    .into(),
            ), // extract_facts
            Script::Text("İkinci cevap".into()),
        ],
        config,
    );
    let runner = h.runner();

    let (_, s1) = runner.process("alice", "telegram", "selam", false).await.unwrap();
    let (_, s2) = runner.process("alice", "telegram", "devam edelim", false).await.unwrap();
    assert_ne!(s1, s2);

    let closed = h.store.get_session(&s1).unwrap().unwrap();
    assert_eq!(closed.close_reason.as_deref(), Some("token_limit"));
    assert!(!closed.summary.as_deref().unwrap_or_default().is_empty());

    let open = h.store.get_open_session("alice", "telegram").unwrap().unwrap();
    assert_eq!(open.session_id, s2);

    let notes = h.store.list_notes("alice", 10).unwrap();
    assert!(notes.iter().any(|n| n.source == "extraction" && n.content.contains("morning")));
    assert_eq!(h.store.get_preferences("alice").unwrap()["drink"], "kahve");
}

// ── Scenario 6: RBAC enforcement ───────────────────────────────────────────

const ROLE_FILE: &str = r#"
default_role = "member"

[roles.owner]
tool_groups = ["messaging", "memory", "scheduling", "delegation"]
context_layers = ["identity", "runtime", "role", "agent_memory", "user_context", "events", "session_summary", "skills"]

[roles.member]
tool_groups = ["messaging", "memory", "delegation"]
context_layers = ["identity", "runtime", "role", "agent_memory", "user_context", "events", "session_summary"]

[roles.guest]
tool_groups = ["messaging"]
context_layers = ["identity", "runtime", "role"]
max_sessions = 1
"#;

fn guest_permissions() -> Permissions {
    let dir = std::env::temp_dir().join(format!("graphbot-roles-{}", uuid_suffix()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("roles.toml");
    std::fs::write(&path, ROLE_FILE).unwrap();
    Permissions::load(&path).unwrap()
}

fn uuid_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    format!("{}", SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos())
}

#[tokio::test]
async fn guest_hallucinated_tool_gets_permission_denied() {
    let h = harness(vec![
        // The model hallucinates a filesystem read the guest never saw.
        Script::ToolCalls(
            vec![("save_note".into(), serde_json::json!({"content": "dosya içeriği"}))],
            String::new(),
        ),
        Script::Text("Üzgünüm, buna iznim yok.".into()),
    ]);
    h.store.set_user_role("alice", UserRole::Guest).unwrap();
    let runner = h.runner_with_permissions(guest_permissions());

    let (reply, session_id) = runner.process("alice", "telegram", "dosyayı oku", false).await.unwrap();
    assert_eq!(reply, "Üzgünüm, buna iznim yok.");

    let messages = h.store.recent_messages(&session_id, 10).unwrap();
    let tool_rows: Vec<_> = messages.iter().filter(|m| m.role == "tool").collect();
    assert_eq!(tool_rows.len(), 1);
    assert_eq!(tool_rows[0].content, "permission denied");
    // The note was never written.
    assert!(h.store.list_notes("alice", 10).unwrap().is_empty());

    // The model was only offered the messaging group.
    let seen = h.provider.seen.lock();
    let offered = &seen[0].1;
    assert!(offered.contains(&"send_message_to_user".to_string()));
    assert!(!offered.iter().any(|t| t == "save_note" || t == "delegate_task"));
}

#[tokio::test]
async fn guest_second_channel_reuses_open_session() {
    let h = harness(vec![]);
    h.store.set_user_role("alice", UserRole::Guest).unwrap();
    let runner = h.runner_with_permissions(guest_permissions());

    let (_, s1) = runner.process("alice", "telegram", "bir", false).await.unwrap();
    let (_, s2) = runner.process("alice", "whatsapp", "iki", false).await.unwrap();
    assert_eq!(s1, s2, "guest session cap must reuse the open session");
    assert_eq!(h.store.count_open_sessions("alice").unwrap(), 1);
}

// ── Delegation through the main agent ──────────────────────────────────────

#[tokio::test]
async fn delegate_task_tool_schedules_and_fires() {
    let h = harness(vec![
        Script::ToolCalls(
            vec![(
                "delegate_task".into(),
                serde_json::json!({"task": "2 saniye sonra bana su içmemi hatırlat"}),
            )],
            String::new(),
        ),
        Script::Text("Tamam, hatırlatacağım.".into()),
    ]);
    // The planner's structured call answers with a delayed static plan.
    h.provider.queue_structured(vec![Ok(serde_json::json!({
        "execution": "delayed",
        "processor": "static",
        "delay_seconds": 0,
        "message": "Su içmeyi unutma!"
    }))]);

    let runner = h.runner();
    let (reply, _) = runner
        .process("alice", "telegram", "bana su içmemi hatırlat", false)
        .await
        .unwrap();
    assert!(reply.contains("hatırlatacağım"));

    settle().await;
    h.scheduler.kick().await;
    assert_eq!(h.telegram.messages(), vec!["Su içmeyi unutma!"]);

    // Audit trail.
    let (_, reminders) = h.scheduler.list("alice").unwrap();
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].status, "sent");
}

// ── Immediate background task + event pickup on the next turn ──────────────

#[tokio::test]
async fn subagent_result_reaches_next_turn_context() {
    let h = harness(vec![Script::Text("Not aldım.".into())]);
    let plan = static_plan(ExecutionKind::Immediate, "Arka plan işi bitti");

    // No open parent session: the result waits in the event queue.
    let task_id = h.worker.spawn("alice", None, &plan, "telegram").unwrap();
    for _ in 0..100 {
        if h.store.get_background_task(&task_id).unwrap().unwrap().status != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let events = h.store.undelivered_events("alice").unwrap();
    assert!(events.iter().any(|e| e.kind == "subagent_result"));

    // The next turn renders the event into the system prompt and marks it
    // delivered.
    let runner = h.runner();
    runner.process("alice", "telegram", "naber", false).await.unwrap();

    let seen = h.provider.seen.lock();
    let system_prompt = &seen.last().unwrap().0[0];
    assert!(system_prompt.content.contains("Arka plan işi bitti"));
    drop(seen);
    assert!(h
        .store
        .undelivered_events("alice")
        .unwrap()
        .iter()
        .all(|e| e.kind != "subagent_result"));
}

// ── Concurrency: conditional close under racing rotations ──────────────────

#[tokio::test]
async fn concurrent_rotation_closes_exactly_once() {
    let h = harness(vec![]);
    let runner = Arc::new(h.runner());
    let (_, session_id) = runner.process("alice", "telegram", "merhaba", false).await.unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let r = runner.clone();
            let sid = session_id.clone();
            tokio::spawn(async move { r.rotate_session(&sid).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;
    for res in results {
        res.unwrap().unwrap();
    }

    let closed = h.store.get_session(&session_id).unwrap().unwrap();
    assert!(!closed.is_open());
    assert_eq!(closed.close_reason.as_deref(), Some("token_limit"));
}

