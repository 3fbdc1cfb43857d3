//! Asynchronous request-reply tasks layered on the dispatcher.
//!
//! One worker task per bot drains that bot's FIFO queue, so submission
//! order is execution order within a bot. Recoverable dispatch failures
//! (no instance, instance gone) retry with exponential backoff until
//! the budget runs out; timeouts and instance-reported errors fail
//! immediately. Terminal states are permanent, enforced by the store's
//! guarded transitions.

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, Result, TaskError};
use crate::store::{StateStore, TaskRecord, TaskState, TaskUpdate};
use crate::telemetry::Metrics;
use crate::{TaskId, TraceId};

use chrono::Utc;
use rand::Rng as _;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Deadline for the best-effort `command.cancel` sent to a running
/// task's bot.
const CANCEL_DISPATCH_DEADLINE: Duration = Duration::from_secs(5);

/// Owns task records and the per-bot worker loops.
pub struct TaskManager {
    store: Arc<dyn StateStore>,
    dispatcher: Arc<Dispatcher>,
    dispatch_deadline: Duration,
    max_retries: u32,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<(TaskId, TraceId)>>>,
    /// Cancel signal per task whose dispatch is currently in flight.
    inflight: Mutex<HashMap<TaskId, CancellationToken>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        dispatcher: Arc<Dispatcher>,
        dispatch_deadline: Duration,
        max_retries: u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            dispatch_deadline,
            max_retries,
            queues: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            shutdown_rx,
        }
    }

    /// Persist a Pending task and queue it for its bot. Returns
    /// immediately; completion is observed by polling `get`.
    pub async fn submit(
        self: &Arc<Self>,
        bot_id: &str,
        command_name: &str,
        arguments: Value,
        trace_id: TraceId,
    ) -> Result<TaskRecord> {
        let record = TaskRecord {
            task_id: uuid::Uuid::new_v4(),
            bot_id: bot_id.to_string(),
            command_name: command_name.to_string(),
            arguments,
            state: TaskState::Pending,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retries_remaining: self.max_retries,
        };
        self.store.put_task(&record).await?;

        Metrics::global().task_queue_depth.inc();
        self.enqueue(bot_id, record.task_id, trace_id);
        tracing::info!(
            trace_id = %trace_id,
            bot_id = %bot_id,
            task_id = %record.task_id,
            command_name = %command_name,
            "task submitted"
        );
        Ok(record)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Cancel a Pending or Running task. The local transition always
    /// wins; a running bot additionally gets a best-effort
    /// `command.cancel`.
    pub async fn cancel(self: &Arc<Self>, task_id: TaskId) -> std::result::Result<TaskRecord, TaskError> {
        let Some(current) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound(task_id));
        };
        if current.state.is_terminal() {
            return Err(TaskError::TerminalState {
                task_id,
                state: current.state.to_string(),
            });
        }

        let was_running = current.state == TaskState::Running;
        let cancelled = self
            .store
            .transition_task(
                task_id,
                &[TaskState::Pending, TaskState::Running],
                TaskUpdate {
                    state: Some(TaskState::Cancelled),
                    error: Some("cancelled by admin".into()),
                    completed_at: Some(Utc::now()),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        let Some(cancelled) = cancelled else {
            // Lost a race with the worker finishing the task.
            let state = self
                .store
                .get_task(task_id)
                .await?
                .map(|task| task.state.to_string())
                .unwrap_or_else(|| "unknown".into());
            return Err(TaskError::TerminalState { task_id, state });
        };

        // Abort the in-flight dispatch so the worker's waiter reaches
        // Cancelled instead of riding out its deadline.
        if let Some(token) = self
            .inflight
            .lock()
            .expect("inflight lock")
            .remove(&task_id)
        {
            token.cancel();
        }

        tracing::info!(task_id = %task_id, was_running, "task cancelled");
        if was_running {
            let dispatcher = self.dispatcher.clone();
            let bot_id = cancelled.bot_id.clone();
            tokio::spawn(async move {
                let arguments = serde_json::json!({ "task_id": task_id });
                if let Err(error) = dispatcher
                    .dispatch(
                        &bot_id,
                        "command.cancel",
                        "command.cancel",
                        &arguments,
                        uuid::Uuid::new_v4(),
                        CANCEL_DISPATCH_DEADLINE,
                    )
                    .await
                {
                    tracing::debug!(task_id = %task_id, %error, "best-effort cancel not delivered");
                }
            });
        }
        Ok(cancelled)
    }

    /// Rebuild the queues after a restart. Tasks that were Running when
    /// the process died lost their in-flight dispatch; that counts as
    /// `InstanceGone` and consumes a retry.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        for task in self.store.list_tasks_in_state(TaskState::Running).await? {
            if task.retries_remaining > 0 {
                self.store
                    .transition_task(
                        task.task_id,
                        &[TaskState::Running],
                        TaskUpdate {
                            state: Some(TaskState::Pending),
                            retries_remaining: Some(task.retries_remaining - 1),
                            ..TaskUpdate::default()
                        },
                    )
                    .await?;
            } else {
                self.store
                    .transition_task(
                        task.task_id,
                        &[TaskState::Running],
                        failed_update("instance gone during restart"),
                    )
                    .await?;
            }
        }

        let pending = self.store.list_tasks_in_state(TaskState::Pending).await?;
        let recovered = pending.len();
        for task in pending {
            Metrics::global().task_queue_depth.inc();
            self.enqueue(&task.bot_id, task.task_id, uuid::Uuid::new_v4());
        }
        if recovered > 0 {
            tracing::info!(recovered, "requeued persisted tasks");
        }
        Ok(())
    }

    /// Queue a task for its bot, spawning the bot's worker on first use.
    fn enqueue(self: &Arc<Self>, bot_id: &str, task_id: TaskId, trace_id: TraceId) {
        let mut queues = self.queues.lock().expect("task queues lock");
        let sender = queues.entry(bot_id.to_string()).or_insert_with(|| {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let manager = self.clone();
            let bot_id = bot_id.to_string();
            tokio::spawn(async move {
                manager.bot_worker(bot_id, queue_rx).await;
            });
            queue_tx
        });
        if sender.send((task_id, trace_id)).is_err() {
            tracing::warn!(bot_id = %bot_id, task_id = %task_id, "task queue is closed");
        }
    }

    /// FIFO worker for one bot. Tasks execute strictly in submission
    /// order.
    async fn bot_worker(
        self: Arc<Self>,
        bot_id: String,
        mut queue_rx: mpsc::UnboundedReceiver<(TaskId, TraceId)>,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                maybe = queue_rx.recv() => match maybe {
                    Some((task_id, trace_id)) => {
                        self.run_task(&bot_id, task_id, trace_id).await;
                        Metrics::global().task_queue_depth.dec();
                    }
                    None => return,
                },
                _ = wait_for_stop(&mut shutdown_rx) => return,
            }
        }
    }

    async fn run_task(&self, bot_id: &str, task_id: TaskId, trace_id: TraceId) {
        let started = self
            .store
            .transition_task(
                task_id,
                &[TaskState::Pending],
                TaskUpdate {
                    state: Some(TaskState::Running),
                    started_at: Some(Utc::now()),
                    ..TaskUpdate::default()
                },
            )
            .await;
        let task = match started {
            Ok(Some(task)) => task,
            // Cancelled while queued, or unknown: nothing to run.
            Ok(None) => return,
            Err(error) => {
                tracing::error!(task_id = %task_id, %error, "failed to start task");
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.inflight
            .lock()
            .expect("inflight lock")
            .insert(task_id, cancel.clone());
        self.execute_task(bot_id, &task, trace_id, &cancel).await;
        self.inflight
            .lock()
            .expect("inflight lock")
            .remove(&task_id);
    }

    /// Dispatch-and-retry loop for one Running task. `cancel` fires when
    /// an admin cancellation wins; the terminal state is already
    /// recorded by then, so the loop just stops.
    async fn execute_task(
        &self,
        bot_id: &str,
        task: &TaskRecord,
        trace_id: TraceId,
        cancel: &CancellationToken,
    ) {
        let task_id = task.task_id;
        let mut retries_remaining = task.retries_remaining;
        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .dispatcher
                .dispatch_cancellable(
                    bot_id,
                    &task.command_name,
                    &task.command_name,
                    &task.arguments,
                    trace_id,
                    self.dispatch_deadline,
                    cancel.clone(),
                )
                .await;

            match outcome {
                Ok(response) => {
                    let result = response
                        .result
                        .as_deref()
                        .and_then(|raw| serde_json::from_slice(raw).ok())
                        .unwrap_or(Value::Null);
                    self.finish(
                        task_id,
                        TaskUpdate {
                            state: Some(TaskState::Completed),
                            result: Some(result),
                            completed_at: Some(Utc::now()),
                            ..TaskUpdate::default()
                        },
                    )
                    .await;
                    return;
                }
                Err(
                    error @ (DispatchError::NoCapableInstance | DispatchError::InstanceGone),
                ) => {
                    if retries_remaining == 0 {
                        self.finish(task_id, failed_update(&error.to_string())).await;
                        return;
                    }
                    retries_remaining -= 1;
                    let persisted = self
                        .store
                        .transition_task(
                            task_id,
                            &[TaskState::Running],
                            TaskUpdate {
                                retries_remaining: Some(retries_remaining),
                                ..TaskUpdate::default()
                            },
                        )
                        .await;
                    // A failed guard means the task was cancelled under us.
                    if !matches!(persisted, Ok(Some(_))) {
                        return;
                    }

                    let delay = backoff_delay(attempt);
                    attempt += 1;
                    tracing::debug!(
                        trace_id = %trace_id,
                        task_id = %task_id,
                        %error,
                        retries_remaining,
                        delay_ms = delay.as_millis() as u64,
                        "retrying task dispatch"
                    );
                    let mut shutdown_rx = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                        _ = shutdown_rx.wait_for(|stop| *stop) => return,
                    }
                }
                Err(error @ DispatchError::Timeout) => {
                    self.finish(task_id, failed_update(&error.to_string())).await;
                    return;
                }
                Err(DispatchError::ExecutionError(message)) => {
                    self.finish(task_id, failed_update(&message)).await;
                    return;
                }
                Err(DispatchError::InvalidArguments(message)) => {
                    self.finish(task_id, failed_update(&message)).await;
                    return;
                }
                Err(DispatchError::Cancelled) => {
                    // The cancel transition already recorded the outcome.
                    tracing::debug!(task_id = %task_id, "in-flight dispatch cancelled");
                    return;
                }
            }
        }
    }

    /// Apply a terminal transition from Running. A `None` result means
    /// an admin cancellation won; the outcome is dropped.
    async fn finish(&self, task_id: TaskId, update: TaskUpdate) {
        match self
            .store
            .transition_task(task_id, &[TaskState::Running], update)
            .await
        {
            Ok(Some(task)) => {
                tracing::info!(task_id = %task_id, state = %task.state, "task finished");
            }
            Ok(None) => {
                tracing::debug!(task_id = %task_id, "dropping outcome for cancelled task");
            }
            Err(error) => {
                tracing::error!(task_id = %task_id, %error, "failed to persist task outcome");
            }
        }
    }
}

fn failed_update(reason: &str) -> TaskUpdate {
    TaskUpdate {
        state: Some(TaskState::Failed),
        error: Some(reason.to_string()),
        completed_at: Some(Utc::now()),
        ..TaskUpdate::default()
    }
}

/// Awaits shutdown without holding the watch guard across the `select!`,
/// which would otherwise make the enclosing future non-`Send`.
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Exponential backoff: base 1s, factor 2, cap 30s, jitter ±25%.
fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exponential.min(BACKOFF_CAP);
    capped.mul_f64(rand::rng().random_range(0.75..=1.25))
}
