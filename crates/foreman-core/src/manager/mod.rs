//! The task manager: a single scheduling loop that owns all in-memory
//! state, plus one worker task per running task.
//!
//! The loop is the only writer of the task table, the waiter table, and
//! every store transition that originates from a scheduling decision.
//! Callers talk to it over four single-item channels (new / kill / wait /
//! finish); producers block until the loop accepts their event or the
//! lifecycle token fires. This gives a total order on scheduling decisions
//! without any locks around the tables.
//!
//! Cancellation is hierarchical: stopping the manager cancels the lifecycle
//! token, which cancels every per-task token derived from it; `kill`
//! cancels a single task's token. Kill never transitions state by itself --
//! the worker's finish event drives all cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use foreman_db::models::{Task, TaskState, TaskType};
use foreman_db::queries::tasks as task_db;

use crate::config::Config;
use crate::error::ManagerError;
use crate::handler::{HandlerRegistry, TaskHandler};

/// A waiter registration: fired exactly once when the task with this id is
/// cleaned up, or immediately when no in-memory entry exists.
struct WaitItem {
    id: i64,
    notify: oneshot::Sender<()>,
}

/// What a worker reports back on its single finish event.
#[derive(Debug, Clone, Default)]
struct WorkerOutcome {
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl WorkerOutcome {
    fn success(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }
}

/// The back-edge from a worker to the loop.
struct Finish {
    id: i64,
    outcome: WorkerOutcome,
}

/// In-memory record of one running task.
///
/// An id is present in the loop's table iff the loop believes the task is
/// currently running in this process; the table is not a cache of durable
/// state. `worker` is false only while a failed store update is blocking
/// the spawn (reconciliation retries those).
struct TaskEntry {
    cancel: CancellationToken,
    task: Task,
    worker: bool,
}

/// Shared handles for one manager run, handed to callers while active.
#[derive(Clone)]
struct LoopHandles {
    cancel: CancellationToken,
    tracker: TaskTracker,
    new_tx: mpsc::Sender<Task>,
    kill_tx: mpsc::Sender<i64>,
    wait_tx: mpsc::Sender<WaitItem>,
}

/// The durable asynchronous task manager.
///
/// Register handlers before [`start`](Self::start); submit, kill, and wait
/// from any task afterwards. Results are read back from the store by id --
/// the manager never exposes in-memory results.
pub struct TaskManager {
    config: Arc<Config>,
    pool: PgPool,
    registry: HandlerRegistry,
    handles: Mutex<Option<LoopHandles>>,
}

impl TaskManager {
    /// Create a manager over the given store and handler registry.
    pub fn new(config: Arc<Config>, pool: PgPool, registry: HandlerRegistry) -> Self {
        Self {
            config,
            pool,
            registry,
            handles: Mutex::new(None),
        }
    }

    /// Register a handler. Registration is expected to complete before
    /// [`start`](Self::start); a running loop keeps its own snapshot.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) {
        self.registry.register(handler);
    }

    /// Launch the scheduling loop.
    ///
    /// Fails with [`ManagerError::AlreadyRunning`] while a loop is active.
    pub fn start(&self) -> Result<(), ManagerError> {
        let mut slot = self.handles.lock().expect("manager handle lock poisoned");
        if slot.is_some() {
            return Err(ManagerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        // Single-item rendezvous channels: the loop is the sole consumer,
        // producers block until it is ready.
        let (new_tx, new_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (wait_tx, wait_rx) = mpsc::channel(1);
        let (finish_tx, finish_rx) = mpsc::channel(1);

        let event_loop = EventLoop {
            config: Arc::clone(&self.config),
            pool: self.pool.clone(),
            handlers: Arc::new(self.registry.clone()),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            new_rx,
            kill_rx,
            wait_rx,
            finish_rx,
            finish_tx,
            tasks: HashMap::new(),
            waiters: HashMap::new(),
            live_workers: 0,
        };
        tracker.spawn(event_loop.run());

        *slot = Some(LoopHandles {
            cancel,
            tracker,
            new_tx,
            kill_tx,
            wait_tx,
        });

        tracing::debug!("task manager started");
        Ok(())
    }

    /// Stop the manager: cancel the lifecycle token and wait for the loop
    /// and every outstanding worker to drain. Idempotent after the first
    /// call.
    pub async fn stop(&self) {
        let handles = self
            .handles
            .lock()
            .expect("manager handle lock poisoned")
            .take();
        let Some(handles) = handles else {
            tracing::debug!("task manager already stopped");
            return;
        };

        handles.cancel.cancel();
        handles.tracker.close();
        handles.tracker.wait().await;

        tracing::debug!("task manager stopped");
    }

    /// Insert a new `waiting` task and deliver it to the loop.
    ///
    /// The id is returned as soon as the record is durable. If the
    /// lifecycle token fires before the loop accepts the record (or the
    /// manager is not running), the record's result is annotated with the
    /// shutdown error and the id is still returned; a later incarnation's
    /// reconciliation may pick the record up.
    pub async fn submit(
        &self,
        task_type: TaskType,
        developer_id: i64,
        account_id: i64,
        args: serde_json::Value,
    ) -> Result<i64, ManagerError> {
        let task =
            task_db::insert_task(&self.pool, task_type, developer_id, account_id, &args).await?;
        let id = task.id;

        let delivered = match self.loop_handles() {
            Some(handles) => tokio::select! {
                res = handles.new_tx.send(task.clone()) => res.is_ok(),
                _ = handles.cancel.cancelled() => false,
            },
            None => false,
        };

        if delivered {
            tracing::debug!(task_id = id, task_type = %task_type, "created new task");
        } else {
            let mut task = task;
            task.result = Some(json!({ "error": ManagerError::ShuttingDown.to_string() }));
            task.updated_at = Utc::now();
            let _ = task_db::update_task(&self.pool, &task).await;
        }

        Ok(id)
    }

    /// Request cancellation of a running task.
    ///
    /// Silently succeeds when the id is unknown; the transition out of
    /// `running` is driven by the worker's finish event, not by this call.
    pub async fn kill(&self, id: i64) {
        let Some(handles) = self.loop_handles() else {
            return;
        };
        tokio::select! {
            _ = handles.kill_tx.send(id) => {}
            _ = handles.cancel.cancelled() => {}
        }
    }

    /// Wait until the task reaches a terminal state.
    ///
    /// Returns immediately when no in-memory entry exists for the id (best
    /// effort: the task may have completed, or it may never have started in
    /// this process). Errors with [`ManagerError::Cancelled`] when the
    /// caller's token fires and [`ManagerError::ShuttingDown`] when the
    /// manager's lifecycle token fires.
    pub async fn wait(&self, caller: CancellationToken, id: i64) -> Result<(), ManagerError> {
        let Some(handles) = self.loop_handles() else {
            return Err(ManagerError::NotRunning);
        };

        let (notify, mut signal) = oneshot::channel();
        tokio::select! {
            res = handles.wait_tx.send(WaitItem { id, notify }) => {
                if res.is_err() {
                    return Err(ManagerError::ShuttingDown);
                }
            }
            _ = caller.cancelled() => return Err(ManagerError::Cancelled),
            _ = handles.cancel.cancelled() => return Err(ManagerError::ShuttingDown),
        }

        tokio::select! {
            res = &mut signal => match res {
                Ok(()) => Ok(()),
                // The loop dropped the waiter list during shutdown.
                Err(_) => Err(ManagerError::ShuttingDown),
            },
            _ = caller.cancelled() => Err(ManagerError::Cancelled),
            _ = handles.cancel.cancelled() => Err(ManagerError::ShuttingDown),
        }
    }

    fn loop_handles(&self) -> Option<LoopHandles> {
        self.handles
            .lock()
            .expect("manager handle lock poisoned")
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct EventLoop {
    config: Arc<Config>,
    pool: PgPool,
    handlers: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    new_rx: mpsc::Receiver<Task>,
    kill_rx: mpsc::Receiver<i64>,
    wait_rx: mpsc::Receiver<WaitItem>,
    finish_rx: mpsc::Receiver<Finish>,
    finish_tx: mpsc::Sender<Finish>,
    tasks: HashMap<i64, TaskEntry>,
    waiters: HashMap<i64, Vec<oneshot::Sender<()>>>,
    /// Workers spawned minus finish events received.
    live_workers: usize,
}

impl EventLoop {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.manager.reconcile_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(item) = self.wait_rx.recv() => self.handle_wait(item),
                Some(id) = self.kill_rx.recv() => self.handle_kill(id),
                Some(finish) = self.finish_rx.recv() => self.handle_finish(finish).await,
                Some(task) = self.new_rx.recv() => self.handle_new(task).await,
                // The first tick fires immediately, which doubles as restart
                // recovery for records a previous process left behind.
                _ = tick.tick() => self.reconcile().await,
            }
        }

        self.shutdown().await;
    }

    fn handle_wait(&mut self, item: WaitItem) {
        if self.tasks.contains_key(&item.id) {
            self.waiters.entry(item.id).or_default().push(item.notify);
        } else {
            // Best effort: the task may have completed, or it may never
            // have started in this process.
            let _ = item.notify.send(());
        }
    }

    fn handle_kill(&mut self, id: i64) {
        if let Some(entry) = self.tasks.get(&id) {
            tracing::debug!(task_id = id, "killing task");
            entry.cancel.cancel();
        }
    }

    async fn handle_finish(&mut self, finish: Finish) {
        self.live_workers = self.live_workers.saturating_sub(1);
        let task = self.tasks.get(&finish.id).map(|e| e.task.clone());
        if let Some(task) = task {
            self.cleanup_task(task, finish.outcome).await;
        }
    }

    async fn handle_new(&mut self, task: Task) {
        // Idempotent against the reconciliation race: an id that is already
        // present must not be started twice.
        if self.tasks.contains_key(&task.id) {
            return;
        }
        self.run_task(task).await;
    }

    /// Transition a task to `running` and spawn its worker.
    ///
    /// The in-memory entry is inserted before the store write. If the write
    /// fails the entry stays with no worker and the spawn is skipped; the
    /// next reconciliation round retries the whole step.
    async fn run_task(&mut self, mut task: Task) {
        let id = task.id;
        let cancel = match self.tasks.get(&id) {
            Some(entry) => entry.cancel.clone(),
            None => {
                let token = self.cancel.child_token();
                self.tasks.insert(
                    id,
                    TaskEntry {
                        cancel: token.clone(),
                        task: task.clone(),
                        worker: false,
                    },
                );
                token
            }
        };

        task.state = TaskState::Running;
        task.updated_at = Utc::now();
        if let Err(err) = task_db::update_task(&self.pool, &task).await {
            tracing::warn!(task_id = id, error = %err, "failed to mark task running");
            return;
        }

        tracing::debug!(task_id = id, task_type = %task.task_type, "task scheduled to run");

        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.task = task.clone();
            entry.worker = true;
        }
        self.live_workers += 1;

        let handlers = Arc::clone(&self.handlers);
        let config = Arc::clone(&self.config);
        let pool = self.pool.clone();
        let finish_tx = self.finish_tx.clone();
        self.tracker.spawn(async move {
            let outcome = execute_handler(&handlers, &config, &pool, &task, cancel).await;
            // Exactly one finish event per worker. The loop drains this
            // channel until every worker has reported, so the send is never
            // lost.
            let _ = finish_tx.send(Finish { id, outcome }).await;
        });
    }

    /// Write the terminal record, fire the task's waiters, and drop the
    /// in-memory entry.
    ///
    /// A failed store write is logged and swallowed: waiters must still
    /// fire and the entry must go away even when durable state lags.
    async fn cleanup_task(&mut self, mut task: Task, outcome: WorkerOutcome) {
        let id = task.id;
        let now = Utc::now();
        task.updated_at = now;
        task.finished_at = Some(now);
        match outcome.error {
            Some(message) => {
                task.state = TaskState::Failed;
                task.result = Some(json!({ "error": message, "result": outcome.result }));
            }
            None => {
                task.state = TaskState::Success;
                task.result = outcome.result;
            }
        }

        if let Err(err) = task_db::update_task(&self.pool, &task).await {
            tracing::warn!(task_id = id, error = %err, "failed to persist terminal task state");
        }

        tracing::debug!(task_id = id, state = %task.state, "task cleaned up");

        if let Some(waiters) = self.waiters.remove(&id) {
            for notify in waiters {
                let _ = notify.send(());
            }
        }
        self.tasks.remove(&id);
    }

    /// Heal drift between the store and memory.
    ///
    /// Scans up to `max_tasks_per_round` incomplete records: `waiting`
    /// records with no live worker are (re)started; `running` records with
    /// no in-memory entry belonged to a previous incarnation and are failed
    /// as killed; anything else is a spurious row and is failed as invalid.
    async fn reconcile(&mut self) {
        let scanned = match task_db::list_incomplete_tasks(
            &self.pool,
            self.config.manager.max_tasks_per_round,
        )
        .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::warn!(error = %err, "reconciliation scan failed");
                return;
            }
        };

        for task in scanned {
            match task.state {
                TaskState::Waiting => {
                    let needs_start = self.tasks.get(&task.id).is_none_or(|e| !e.worker);
                    if needs_start {
                        self.run_task(task).await;
                    }
                }
                TaskState::Running => {
                    if !self.tasks.contains_key(&task.id) {
                        self.cleanup_task(task, WorkerOutcome::failure("killed")).await;
                    }
                }
                _ => {
                    self.cleanup_task(task, WorkerOutcome::failure("invalid task"))
                        .await;
                }
            }
        }

        for entry in self.tasks.values() {
            tracing::debug!(
                task_id = entry.task.id,
                task_type = %entry.task.task_type,
                "task still running"
            );
        }
    }

    /// Drain on lifecycle cancellation.
    ///
    /// Cancels every per-task token, receives the one finish event each
    /// live worker is guaranteed to deliver, then terminally fails any
    /// entries whose worker never spawned. Waiters for unknown ids were
    /// fired on registration; the rest resolve through their dropped
    /// senders.
    async fn shutdown(&mut self) {
        for entry in self.tasks.values() {
            entry.cancel.cancel();
        }

        while self.live_workers > 0 {
            match self.finish_rx.recv().await {
                Some(finish) => self.handle_finish(finish).await,
                None => break,
            }
        }

        let stalled: Vec<i64> = self.tasks.keys().copied().collect();
        for id in stalled {
            let Some(task) = self.tasks.get(&id).map(|e| e.task.clone()) else {
                continue;
            };
            self.cleanup_task(task, WorkerOutcome::failure("task manager stopped"))
                .await;
        }

        self.waiters.clear();
        self.tasks.clear();
    }
}

/// Run one handler invocation, trapping errors and panics into the
/// worker's outcome.
async fn execute_handler(
    handlers: &HandlerRegistry,
    config: &Config,
    pool: &PgPool,
    task: &Task,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let Some(handler) = handlers.get(task.task_type) else {
        return WorkerOutcome::failure(format!(
            "task {} has no registered handler for type {}",
            task.id, task.task_type
        ));
    };

    let invocation = std::panic::AssertUnwindSafe(handler.run(cancel, config, pool, task));
    match invocation.catch_unwind().await {
        Ok(Ok(result)) => WorkerOutcome::success(result),
        Ok(Err(err)) => {
            WorkerOutcome::failure(format!("execute task {} failed: {err:#}", task.id))
        }
        Err(panic) => WorkerOutcome::failure(panic_message(panic)),
    }
}

/// Render a trapped panic payload as text.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_renders_str_and_string() {
        assert_eq!(panic_message(Box::new("bad")), "bad");
        assert_eq!(panic_message(Box::new("worse".to_owned())), "worse");
        assert_eq!(panic_message(Box::new(42_u32)), "handler panicked");
    }

    #[test]
    fn outcome_shapes() {
        let ok = WorkerOutcome::success(json!({"v": 1}));
        assert!(ok.error.is_none());

        let err = WorkerOutcome::failure("nope");
        assert_eq!(err.error.as_deref(), Some("nope"));
        assert!(err.result.is_none());
    }
}
