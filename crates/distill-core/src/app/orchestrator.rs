//! Orchestrator - polling loop, task execution, retries and recovery
//!
//! Flow of one task:
//! 1. a pipeline event arrives; the wiring creates the next stage's task
//!    (deduplicated per unit)
//! 2. the poller picks due tasks by priority, up to `max_concurrent`
//! 3. `execute` marks the task Processing, runs its handler and records the
//!    outcome (Completed, Pending with backoff, or Failed)
//! 4. the finished slot wakes the poller so more work starts right away
//!
//! Handlers are never cancelled: `stop` only prevents new starts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::OrchestratorConfig;
use super::event_bus::{EventBus, Subscription};
use super::recovery::{
    RecoveryReport, is_stale, resume_point, stale_patch, units_with_live_tasks,
};
use super::status::OrchestratorStatus;
use super::wiring::{WIRING, priority_for};
use crate::domain::{
    ConversationalUnit, HandlerError, NewTask, PipelineEvent, Priority, StoreError, TaskChange,
    TaskId, TaskPatch, TaskRecord, TaskStatus, TaskType, UnitId, unit_id_of,
};
use crate::error::OrchestratorError;
use crate::ports::{Clock, KnowledgeStore, TaskStore};
use crate::typed::{Handler, HandlerRegistry, RegistryError, TaskContext, TaskHandler, TaskPayload};

const CHANGE_CAPACITY: usize = 256;

struct Poller {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct Inner {
    config: OrchestratorConfig,
    tasks: Arc<dyn TaskStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    registry: RwLock<HandlerRegistry>,
    active: Mutex<HashSet<TaskId>>,
    running: AtomicBool,
    initialized: AtomicBool,
    recovered: AtomicBool,
    /// Serializes scan+create in `create_task_if_not_exists`.
    create_lock: tokio::sync::Mutex<()>,
    /// Serializes fetch+start so two ticks never pick the same task.
    tick_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    wiring: Mutex<Vec<Subscription>>,
    poller: Mutex<Option<Poller>>,
    changes: broadcast::Sender<TaskChange>,
}

/// Orchestrator はタスクの生成・実行・リトライ・復旧を一手に担う
///
/// # 使用例
/// ```ignore
/// let orch = OrchestratorBuilder::new()
///     .handlers(stage_handlers(model, &PipelineConfig::default())?)?
///     .build()?;
/// orch.initialize().await?;   // wiring + 復旧 + (auto_start なら) ポーリング開始
/// let unit_id = orch.submit_unit(ConversationalUnit::new(text, "s1", now)).await?;
/// // ... UnitCompleted を待つ
/// orch.shutdown().await;
/// ```
///
/// # ライフサイクル
/// - `initialize`: 1 回だけ有効。2 回目以降は何もしない
/// - `start` / `stop`: ポーリングの開始と停止。実行中の Handler は止めない
/// - `shutdown`: `stop` に加えてポーラーの終了を待つ
///
/// # 不変条件
/// - 同時に実行されるタスクは `max_concurrent` 以下
/// - 同じ `(task_type, unit_id)` の未完了タスクは 1 つだけ
/// - `Failed` のタスクは `attempts >= max_attempts` かつ `next_retry_at` なし
///
/// Clone は安価で、複製はすべて同じ Orchestrator を操作します。
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub(crate) fn from_parts(
        config: OrchestratorConfig,
        tasks: Arc<dyn TaskStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        registry: HandlerRegistry,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                tasks,
                knowledge,
                bus,
                clock,
                registry: RwLock::new(registry),
                active: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                recovered: AtomicBool::new(false),
                create_lock: tokio::sync::Mutex::new(()),
                tick_lock: tokio::sync::Mutex::new(()),
                wake: Arc::new(Notify::new()),
                wiring: Mutex::new(Vec::new()),
                poller: Mutex::new(None),
                changes,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.inner.tasks)
    }

    pub fn knowledge_store(&self) -> Arc<dyn KnowledgeStore> {
        Arc::clone(&self.inner.knowledge)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Wire events to tasks, recover, and start polling if `auto_start`.
    /// Later calls are no-ops.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            info!("orchestrator already initialized");
            return Ok(());
        }
        self.wire();
        let report = self.recover().await?;
        info!(
            stale_reset = report.stale_reset,
            stale_failed = report.stale_failed,
            units_resumed = report.units_resumed,
            "orchestrator initialized"
        );
        if self.inner.config.auto_start {
            self.start();
        }
        Ok(())
    }

    fn wire(&self) {
        let mut subscriptions = Vec::with_capacity(WIRING.len());
        for (event, task_type, priority) in WIRING {
            let weak = Arc::downgrade(&self.inner);
            let sub = self.inner.bus.on(event, move |event: PipelineEvent| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let payload = event.task_payload();
                    if let Err(e) = Inner::ensure_task(&inner, task_type, payload, priority).await {
                        error!(
                            event = %event.name(),
                            unit_id = %event.unit_id,
                            task_type = %task_type,
                            error = %e,
                            "failed to create downstream task"
                        );
                    }
                }
            });
            subscriptions.push(sub);
        }
        *self.inner.wiring.lock().unwrap_or_else(PoisonError::into_inner) = subscriptions;
        debug!(routes = WIRING.len(), "event wiring established");
    }

    pub fn register_handler<T: TaskPayload, H: Handler<T> + 'static>(
        &self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.inner.registry_mut().register::<T, H>(handler)?;
        info!(task_type = %T::TYPE, "handler registered");
        Ok(())
    }

    pub fn register_dyn(&self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type();
        self.inner.registry_mut().register_dyn(handler)?;
        info!(task_type = %task_type, "handler registered");
        Ok(())
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.inner.registry().registered_types()
    }

    /// Begin polling. The first tick fires immediately.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.wake),
            self.inner.config.poll_interval(),
            shutdown_rx,
        ));
        *self.inner.poller.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Poller { shutdown_tx, join });
        info!(
            poll_interval_ms = self.inner.config.poll_interval_ms,
            max_concurrent = self.inner.config.max_concurrent,
            "orchestrator started"
        );
    }

    /// Stop starting new tasks. In-flight executions run to completion.
    pub fn stop(&self) {
        drop(self.halt());
    }

    /// Stop and wait for the poller to exit.
    pub async fn shutdown(&self) {
        if let Some(join) = self.halt() {
            let _ = join.await;
        }
        info!("orchestrator shut down");
    }

    fn halt(&self) -> Option<JoinHandle<()>> {
        self.inner.running.store(false, Ordering::Release);
        let poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        // ignore send error: the loop may already be gone
        let _ = poller.shutdown_tx.send(true);
        info!("orchestrator stopped");
        Some(poller.join)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Run one scheduling pass now, whether or not the poller is running.
    /// Returns how many tasks were started.
    pub async fn poll_now(&self) -> Result<usize, OrchestratorError> {
        Ok(Inner::tick(&self.inner).await?)
    }

    pub async fn create_task(&self, task: NewTask) -> Result<TaskId, OrchestratorError> {
        Ok(self.inner.create(task).await?)
    }

    /// Create a task unless a non-completed task of the same type already
    /// targets the payload's unit; then that task's id is returned.
    pub async fn create_task_if_not_exists(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<TaskId, OrchestratorError> {
        let (id, _) = Inner::ensure_task(&self.inner, task_type, payload, priority).await?;
        Ok(id)
    }

    /// Persist a unit and announce it to the pipeline.
    pub async fn submit_unit(&self, unit: ConversationalUnit) -> Result<UnitId, OrchestratorError> {
        let id = unit.id;
        let session_id = unit.session_id.clone();
        self.inner.knowledge.put_unit(unit).await?;
        info!(unit_id = %id, session_id = %session_id, "unit submitted");
        self.inner.bus.emit(PipelineEvent::unit_created(id, session_id));
        Ok(id)
    }

    pub async fn get_status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let pending = self.inner.tasks.get_by_status(TaskStatus::Pending).await?;
        let failed = self.inner.tasks.get_by_status(TaskStatus::Failed).await?;
        Ok(OrchestratorStatus {
            is_running: self.is_running(),
            active_tasks: self.inner.active_count(),
            pending_tasks: pending.len(),
            failed_tasks: failed.len(),
        })
    }

    /// Live task transitions. Slow receivers miss messages (`Lagged`).
    pub fn subscribe_task_changes(&self) -> broadcast::Receiver<TaskChange> {
        self.inner.changes.subscribe()
    }

    /// Delete Completed and Failed tasks that finished more than `older_than` ago.
    pub async fn prune_finished(
        &self,
        older_than: chrono::Duration,
    ) -> Result<usize, OrchestratorError> {
        let cutoff = self.inner.clock.now() - older_than;
        let mut pruned = 0;
        for status in [TaskStatus::Completed, TaskStatus::Failed] {
            for task in self.inner.tasks.get_by_status(status).await? {
                if task.completed_at.is_some_and(|t| t < cutoff) {
                    self.inner.tasks.delete(task.id).await?;
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned finished tasks");
        }
        Ok(pruned)
    }

    /// Reconcile state left behind by a previous process. Runs once; later
    /// calls return an empty report.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        if self.inner.recovered.swap(true, Ordering::AcqRel) {
            debug!("recovery already ran");
            return Ok(RecoveryReport::default());
        }
        let inner = &self.inner;
        let now = inner.clock.now();
        let threshold = chrono::Duration::milliseconds(inner.config.stale_threshold_ms as i64);
        let mut report = RecoveryReport::default();

        for task in inner.tasks.get_by_status(TaskStatus::Processing).await? {
            if !is_stale(&task, now, threshold) || inner.is_active(task.id) {
                continue;
            }
            let updated = inner.tasks.update(task.id, stale_patch(&task, now)).await?;
            if updated.status == TaskStatus::Failed {
                report.stale_failed += 1;
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempts = task.attempts,
                    "stale task out of attempts, marked failed"
                );
            } else {
                report.stale_reset += 1;
                warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempts = task.attempts,
                    "stale task reset to pending"
                );
            }
            inner.publish(&updated);
        }

        let live = units_with_live_tasks(&inner.tasks.get_all().await?);
        for unit in inner.knowledge.unprocessed_units().await? {
            if live.contains(&unit.id) {
                report.units_in_flight += 1;
                continue;
            }
            let task_type = resume_point(inner.knowledge.as_ref(), &unit).await?;
            let payload = json!({ "unit_id": unit.id, "session_id": unit.session_id });
            let (_, created) =
                Inner::ensure_task(inner, task_type, payload, priority_for(task_type)).await?;
            if created {
                report.units_resumed += 1;
                info!(unit_id = %unit.id, task_type = %task_type, "resuming unit");
            } else {
                report.units_in_flight += 1;
            }
        }
        Ok(report)
    }
}

impl Inner {
    fn registry(&self) -> std::sync::RwLockReadGuard<'_, HandlerRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, HandlerRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn is_active(&self, id: TaskId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Reserve a slot for `id`. Fails when at capacity or already running.
    fn claim(&self, id: TaskId) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.len() >= self.config.max_concurrent {
            return false;
        }
        active.insert(id)
    }

    fn release(&self, id: TaskId) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn publish(&self, task: &TaskRecord) {
        // no receivers is fine
        let _ = self.changes.send(TaskChange {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            attempts: task.attempts,
        });
    }

    async fn create(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let record = task.into_record(
            TaskId::new(),
            self.clock.now(),
            self.config.max_attempts,
            &self.config.backoff,
        );
        let id = self.tasks.create(record.clone()).await?;
        debug!(task_id = %id, task_type = %record.task_type, priority = ?record.priority, "task created");
        self.publish(&record);
        self.wake.notify_one();
        Ok(id)
    }

    /// Returns the task id and whether it was newly created.
    async fn ensure_task(
        self: &Arc<Self>,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<(TaskId, bool), StoreError> {
        let new_task = NewTask::new(task_type, payload).with_priority(priority);
        let Some(unit_id) = unit_id_of(&new_task.payload) else {
            warn!(task_type = %task_type, "payload has no unit_id; creating without dedup");
            return Ok((self.create(new_task).await?, true));
        };

        let _guard = self.create_lock.lock().await;
        let existing = self.tasks.get_all().await?.into_iter().find(|t| {
            t.task_type == task_type
                && t.status != TaskStatus::Completed
                && t.unit_id() == Some(unit_id)
        });
        if let Some(task) = existing {
            debug!(
                task_id = %task.id,
                task_type = %task_type,
                unit_id = %unit_id,
                status = %task.status,
                "task already exists for unit"
            );
            return Ok((task.id, false));
        }
        Ok((self.create(new_task).await?, true))
    }

    async fn tick(self: &Arc<Self>) -> Result<usize, StoreError> {
        let _guard = self.tick_lock.lock().await;
        if self.active_count() >= self.config.max_concurrent {
            return Ok(0);
        }

        let now = self.clock.now();
        let mut candidates = self.tasks.get_pending(now).await?;
        candidates.extend(self.tasks.get_retryable(now).await?);

        let registered: HashSet<TaskType> =
            self.registry().registered_types().into_iter().collect();
        let mut seen = HashSet::new();
        candidates.retain(|t| {
            seen.insert(t.id)
                && registered.contains(&t.task_type)
                && !self.is_active(t.id)
                && t.is_due(now)
        });
        candidates.sort_by(|a, b| {
            b.priority
                .value()
                .cmp(&a.priority.value())
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut started = 0;
        for task in candidates {
            if !self.claim(task.id) {
                break;
            }
            started += 1;
            tokio::spawn(Inner::execute(Arc::clone(self), task));
        }
        if started > 0 {
            debug!(started, active = self.active_count(), "tasks started");
        }
        Ok(started)
    }

    async fn execute(self: Arc<Self>, task: TaskRecord) {
        let id = task.id;
        let task_type = task.task_type;
        if let Err(e) = self.run(task).await {
            error!(task_id = %id, task_type = %task_type, error = %e, "task bookkeeping failed");
        }
        self.release(id);
        self.wake.notify_one();
    }

    async fn run(&self, task: TaskRecord) -> Result<(), StoreError> {
        let attempt = task.attempts + 1;
        let started = self
            .tasks
            .update(task.id, TaskPatch::start(attempt, self.clock.now()))
            .await?;
        self.publish(&started);
        debug!(task_id = %started.id, task_type = %started.task_type, attempt, "task started");

        let outcome = self.invoke(&started, attempt).await;
        let now = self.clock.now();
        let finished = match outcome {
            Ok(()) => {
                info!(task_id = %started.id, task_type = %started.task_type, attempt, "task completed");
                self.tasks.update(started.id, TaskPatch::complete(now)).await?
            }
            Err(err) if attempt >= started.max_attempts => {
                error!(
                    task_id = %started.id,
                    task_type = %started.task_type,
                    attempts = attempt,
                    max_attempts = started.max_attempts,
                    error = %err,
                    "task failed permanently"
                );
                self.tasks
                    .update(started.id, TaskPatch::fail(err.to_string(), now))
                    .await?
            }
            Err(err) => {
                let delay = started.backoff.next_delay(attempt);
                let next = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                warn!(
                    task_id = %started.id,
                    task_type = %started.task_type,
                    attempts = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed, will retry"
                );
                self.tasks
                    .update(started.id, TaskPatch::retry(err.to_string(), now, next))
                    .await?
            }
        };
        self.publish(&finished);
        Ok(())
    }

    /// Run the handler on its own tokio task so a panic surfaces as an error.
    async fn invoke(&self, task: &TaskRecord, attempt: u32) -> Result<(), HandlerError> {
        let Some(handler) = self.registry().get(task.task_type) else {
            return Err(HandlerError::MissingHandler(task.task_type));
        };
        let mut ctx = TaskContext::new(
            task.id,
            task.task_type,
            attempt,
            task.checkpoint.clone(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.knowledge),
            self.bus.clone(),
            Arc::clone(&self.clock),
        );
        let payload = task.payload.clone();
        match tokio::spawn(async move { handler.execute(payload, &mut ctx).await }).await {
            Ok(result) => result,
            Err(join) => Err(HandlerError::other(format!("handler aborted: {join}"))),
        }
    }
}

async fn poll_loop(
    inner: Weak<Inner>,
    wake: Arc<Notify>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = Inner::tick(&inner).await {
            error!(error = %e, "poll failed");
        }
    }
    debug!("poller exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::OrchestratorBuilder;
    use crate::domain::{BackoffConfig, UnitId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::ManualClock;
    use crate::typed::handler::tests::{EchoHandler, EchoTask};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FlakyTask {
        unit_id: UnitId,
    }

    impl TaskPayload for FlakyTask {
        const TYPE: TaskType = TaskType::Extract;
    }

    struct AlwaysFails(Arc<AtomicU32>);

    #[async_trait]
    impl Handler<FlakyTask> for AlwaysFails {
        async fn handle(&self, _task: FlakyTask, _ctx: &mut TaskContext) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::other("boom"))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            auto_start: false,
            backoff: BackoffConfig {
                jitter: false,
                ..BackoffConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(clock: Arc<ManualClock>) -> (Orchestrator, Arc<InMemoryTaskStore>) {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let orch = OrchestratorBuilder::new()
            .config(config())
            .task_store(tasks.clone())
            .clock(clock)
            .build()
            .unwrap();
        (orch, tasks)
    }

    async fn settle(orch: &Orchestrator) {
        for _ in 0..200 {
            if orch.inner.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tasks did not settle");
    }

    #[tokio::test]
    async fn dedups_per_unit_and_type() {
        let (orch, tasks) = orchestrator(Arc::new(ManualClock::new(Utc::now())));
        let payload = json!({ "unit_id": UnitId::new() });
        let a = orch
            .create_task_if_not_exists(TaskType::Extract, payload.clone(), Priority::Normal)
            .await
            .unwrap();
        let b = orch
            .create_task_if_not_exists(TaskType::Extract, payload.clone(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(tasks.len().await, 1);

        // different type for the same unit is a different task
        orch.create_task_if_not_exists(TaskType::Preprocess, payload, Priority::High)
            .await
            .unwrap();
        assert_eq!(tasks.len().await, 2);
    }

    #[tokio::test]
    async fn payload_without_unit_is_created_unconditionally() {
        let (orch, tasks) = orchestrator(Arc::new(ManualClock::new(Utc::now())));
        for _ in 0..2 {
            orch.create_task_if_not_exists(TaskType::Extract, json!({}), Priority::Normal)
                .await
                .unwrap();
        }
        assert_eq!(tasks.len().await, 2);
    }

    #[tokio::test]
    async fn completed_task_does_not_block_a_new_one() {
        let (orch, tasks) = orchestrator(Arc::new(ManualClock::new(Utc::now())));
        orch.register_handler::<EchoTask, _>(EchoHandler).unwrap();
        let unit = UnitId::new();
        let first = orch
            .create_task_if_not_exists(TaskType::Preprocess, json!({ "unit_id": unit }), Priority::High)
            .await
            .unwrap();
        assert_eq!(orch.poll_now().await.unwrap(), 1);
        settle(&orch).await;
        assert_eq!(
            tasks.get_by_id(first).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );

        let second = orch
            .create_task_if_not_exists(TaskType::Preprocess, json!({ "unit_id": unit }), Priority::High)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_then_fails() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (orch, tasks) = orchestrator(clock.clone());
        let calls = Arc::new(AtomicU32::new(0));
        orch.register_handler::<FlakyTask, _>(AlwaysFails(calls.clone()))
            .unwrap();
        let id = orch
            .create_task(NewTask::new(TaskType::Extract, json!({ "unit_id": UnitId::new() })))
            .await
            .unwrap();

        orch.poll_now().await.unwrap();
        settle(&orch).await;
        let task = tasks.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.next_retry_at, Some(clock.now() + chrono::Duration::seconds(1)));
        assert_eq!(task.last_error.as_deref(), Some("boom"));

        // not due yet
        assert_eq!(orch.poll_now().await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(1));
        orch.poll_now().await.unwrap();
        settle(&orch).await;
        let task = tasks.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.next_retry_at, Some(clock.now() + chrono::Duration::seconds(2)));

        clock.advance(chrono::Duration::seconds(2));
        orch.poll_now().await.unwrap();
        settle(&orch).await;
        let task = tasks.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.attempts >= task.max_attempts);
        assert_eq!(task.next_retry_at, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(orch.poll_now().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tasks_without_handler_are_not_picked() {
        let (orch, tasks) = orchestrator(Arc::new(ManualClock::new(Utc::now())));
        let id = orch
            .create_task(NewTask::new(TaskType::RunObservers, json!({ "unit_id": UnitId::new() })))
            .await
            .unwrap();
        assert_eq!(orch.poll_now().await.unwrap(), 0);
        assert_eq!(
            tasks.get_by_id(id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn missing_handler_goes_through_the_retry_path() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (orch, tasks) = orchestrator(clock.clone());
        let record = NewTask::new(TaskType::RunObservers, json!({})).into_record(
            TaskId::new(),
            clock.now(),
            3,
            &BackoffConfig::default(),
        );
        let id = record.id;
        tasks.insert_raw(record.clone()).await;

        orch.inner.run(record).await.unwrap();
        let task = tasks.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("handler not found"));
    }

    #[tokio::test]
    async fn respects_max_concurrent_and_priority() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tasks = Arc::new(InMemoryTaskStore::new());
        let orch = OrchestratorBuilder::new()
            .config(OrchestratorConfig {
                max_concurrent: 1,
                ..config()
            })
            .task_store(tasks.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        orch.register_handler::<EchoTask, _>(EchoHandler).unwrap();

        let low = orch
            .create_task(NewTask::new(TaskType::Preprocess, json!({ "unit_id": UnitId::new() }))
                    .with_priority(Priority::Low))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let high = orch
            .create_task(NewTask::new(TaskType::Preprocess, json!({ "unit_id": UnitId::new() }))
                    .with_priority(Priority::Critical))
            .await
            .unwrap();

        assert_eq!(orch.poll_now().await.unwrap(), 1);
        settle(&orch).await;
        assert_eq!(
            tasks.get_by_id(high).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            tasks.get_by_id(low).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failed_attempt() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct PanicTask {}
        impl TaskPayload for PanicTask {
            const TYPE: TaskType = TaskType::RunObservers;
        }
        struct Panics;
        #[async_trait]
        impl Handler<PanicTask> for Panics {
            async fn handle(&self, _t: PanicTask, _ctx: &mut TaskContext) -> Result<(), HandlerError> {
                panic!("handler bug");
            }
        }

        let (orch, tasks) = orchestrator(Arc::new(ManualClock::new(Utc::now())));
        orch.register_handler::<PanicTask, _>(Panics).unwrap();
        let id = orch
            .create_task(NewTask::new(TaskType::RunObservers, json!({})))
            .await
            .unwrap();
        orch.poll_now().await.unwrap();
        settle(&orch).await;

        let task = tasks.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.last_error.unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn start_and_stop_toggle_running() {
        let (orch, _) = orchestrator(Arc::new(ManualClock::new(Utc::now())));
        assert!(!orch.is_running());
        orch.start();
        orch.start();
        assert!(orch.is_running());
        orch.shutdown().await;
        assert!(!orch.get_status().await.unwrap().is_running);
    }
}
