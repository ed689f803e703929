// GraphBot Engine — Subagent Worker
// Fire-and-forget immediate background execution. The caller gets a task id
// straight away; the plan runs on its own tokio task with the same three
// processor semantics as a scheduler trigger. Results land in three places:
// the background_tasks row, a subagent_result system event, and — when the
// parent session is still open — a direct push through the channel port.
// Consumers dedupe on event_id.

use std::sync::Arc;

use log::{info, warn};

use crate::atoms::error::EngineResult;
use crate::atoms::plan::ExecutionPlan;
use crate::engine::dispatch::Dispatcher;
use crate::engine::events::EventBus;
use crate::engine::store::Store;

pub struct SubagentWorker {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventBus>,
}

impl SubagentWorker {
    pub fn new(store: Arc<Store>, dispatcher: Arc<Dispatcher>, events: Arc<EventBus>) -> Self {
        SubagentWorker { store, dispatcher, events }
    }

    /// Insert the running task row and kick off execution. Returns the task
    /// id immediately.
    pub fn spawn(
        &self,
        user_id: &str,
        parent_session: Option<&str>,
        plan: &ExecutionPlan,
        channel: &str,
    ) -> EngineResult<String> {
        let task_id = self.store.create_background_task(user_id, parent_session, channel, plan)?;
        info!("[worker] Spawned task {} for {}", task_id, user_id);

        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let events = self.events.clone();
        let task_id_out = task_id.clone();
        let user_id = user_id.to_string();
        let parent_session = parent_session.map(str::to_string);
        let channel = channel.to_string();
        let plan = plan.clone();

        tokio::spawn(async move {
            let result = dispatcher.dispatch(&user_id, &channel, &plan).await;

            let (payload, push_text) = match &result {
                Ok(outcome) => {
                    let text = outcome.detail.clone().unwrap_or_default();
                    store.complete_background_task(&task_id, Ok(&text)).ok();
                    (
                        serde_json::json!({
                            "task_id": task_id,
                            "status": "completed",
                            "text": text,
                        }),
                        text,
                    )
                }
                Err(e) => {
                    let err = e.to_string();
                    store.complete_background_task(&task_id, Err(&err)).ok();
                    (
                        serde_json::json!({
                            "task_id": task_id,
                            "status": "failed",
                            "error": err.clone(),
                        }),
                        format!("Background task failed: {err}"),
                    )
                }
            };

            // Exactly one subagent_result event per completed task.
            let event_id = match events.emit(&user_id, "subagent_result", &payload) {
                Ok(id) => id,
                Err(e) => {
                    warn!("[worker] Could not emit result event for {}: {}", task_id, e);
                    return;
                }
            };

            // Live session → push now and mark delivered; otherwise the
            // context builder picks the event up on the next turn.
            let session_open = match &parent_session {
                Some(sid) => store
                    .get_session(sid)
                    .ok()
                    .flatten()
                    .is_some_and(|s| s.is_open()),
                None => false,
            };
            if session_open && !push_text.is_empty() {
                match dispatcher.channels().send(&user_id, &channel, &push_text).await {
                    Ok(()) => events.acknowledge(&[event_id]),
                    Err(e) => {
                        warn!("[worker] Direct push failed for {}: {}", task_id, e);
                    }
                }
            }
        });

        Ok(task_id_out)
    }
}
