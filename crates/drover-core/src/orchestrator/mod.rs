//! The orchestrator facade: glues the state machine, worker registry,
//! snapshot store, pool supervisor, and arbitration board into the three
//! public interfaces (intake, worker control, arbitration).
//!
//! Dispatch is event-driven rather than polled: every capacity change
//! (worker registered, result reported, failure recorded, task cancelled)
//! immediately drains as much of the queue as placement allows. Retry plans
//! are honored by a delayed re-enqueue that re-checks task state before
//! touching the queue, so a task cancelled during its retry window is not
//! retried further.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::arbitration::scorer::ConfidenceScorer;
use crate::arbitration::{ArbitrationBoard, ArbitrationContext, ArbitrationError};
use crate::config::Config;
use crate::event::EventBus;
use crate::model::{
    ArbitrationResult, FinalDecision, HealthStatus, PleadingDecision, Priority, TaskMetadata,
    TaskState,
};
use crate::registry::{self, WorkerRegistry, WorkerRepository};
use crate::snapshot::{self, SaveRequest, SnapshotRepository, SnapshotStore};
use crate::state::TaskStateMachine;
use crate::supervisor::{
    EvaluateRequest, Placement, PoolSupervisor, RetryPlan, WorkerDescriptor,
};

/// A work request entering through the intake boundary.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Assigned from a v4 UUID when omitted.
    pub id: Option<String>,
    /// Opaque; never parsed by the core.
    pub payload: serde_json::Value,
    pub metadata: TaskMetadata,
}

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Placed on a worker immediately.
    Assigned { worker_id: String },
    /// Accepted and queued for the next free worker.
    Queued,
    /// Rejected softly; no task record was created. Re-submit after the
    /// advisory cooldown.
    Backpressure { retry_after: Duration },
}

/// Receipt returned from [`Orchestrator::submit`].
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub outcome: SubmitOutcome,
}

/// Worker registration request on the worker control interface.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub id: String,
    pub capabilities: std::collections::BTreeMap<String, serde_json::Value>,
    pub initial_health: Option<HealthStatus>,
    pub initial_saturation: Option<f64>,
}

/// A worker's successful output for a task.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub output: serde_json::Value,
    pub confidence: Option<f64>,
    pub evidence: Option<serde_json::Value>,
}

/// A worker's failure report for a task.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Opaque failure class tag (e.g. `"network"`, `"timeout"`).
    pub error_type: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
struct TaskRecord {
    payload: serde_json::Value,
    metadata: TaskMetadata,
    assigned_worker: Option<String>,
    output: Option<serde_json::Value>,
}

/// Priority-ordered FIFO: urgent first, FIFO within a class.
#[derive(Debug, Default)]
struct DispatchQueue {
    lanes: [VecDeque<String>; 4],
}

impl DispatchQueue {
    fn lane(priority: Priority) -> usize {
        match priority {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    fn push(&mut self, priority: Priority, task_id: String) {
        self.lanes[Self::lane(priority)].push_back(task_id);
    }

    /// Put a task back at the head of its lane after a failed placement.
    fn push_front(&mut self, priority: Priority, task_id: String) {
        self.lanes[Self::lane(priority)].push_front(task_id);
    }

    fn pop(&mut self) -> Option<String> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    fn remove(&mut self, task_id: &str) -> bool {
        for lane in &mut self.lanes {
            if let Some(pos) = lane.iter().position(|id| id == task_id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// The control plane.
pub struct Orchestrator {
    config: Config,
    events: EventBus,
    state: Arc<TaskStateMachine>,
    registry: Arc<WorkerRegistry>,
    snapshots: Arc<SnapshotStore>,
    supervisor: Arc<PoolSupervisor>,
    board: ArbitrationBoard,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    queue: Mutex<DispatchQueue>,
    cancel: CancellationToken,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    /// Handle back to ourselves for delayed re-queue tasks.
    self_ref: Weak<Self>,
}

impl Orchestrator {
    /// Build a control plane over the given snapshot backend, with no
    /// durable worker rows.
    pub fn new(config: Config, snapshot_repository: Arc<dyn SnapshotRepository>) -> Arc<Self> {
        Self::build(config, snapshot_repository, None)
    }

    /// Build a control plane that also writes worker rows through to
    /// durable storage.
    pub fn with_worker_repository(
        config: Config,
        snapshot_repository: Arc<dyn SnapshotRepository>,
        worker_repository: Arc<dyn WorkerRepository>,
    ) -> Arc<Self> {
        Self::build(config, snapshot_repository, Some(worker_repository))
    }

    fn build(
        config: Config,
        snapshot_repository: Arc<dyn SnapshotRepository>,
        worker_repository: Option<Arc<dyn WorkerRepository>>,
    ) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        let registry = match worker_repository {
            Some(repo) => WorkerRegistry::with_repository(events.clone(), repo),
            None => WorkerRegistry::new(events.clone()),
        };
        let snapshots = SnapshotStore::new(
            snapshot_repository,
            config.snapshot.clone(),
            events.clone(),
        );
        let supervisor = PoolSupervisor::new(config.supervisor());
        let board = ArbitrationBoard::new(
            config.arbitration.clone(),
            ConfidenceScorer::new(config.scorer.clone()),
        );

        Arc::new_cyclic(|weak| Self {
            state: Arc::new(TaskStateMachine::new(events.clone())),
            registry: Arc::new(registry),
            snapshots: Arc::new(snapshots),
            supervisor: Arc::new(supervisor),
            board,
            tasks: Mutex::new(HashMap::new()),
            queue: Mutex::new(DispatchQueue::default()),
            cancel: CancellationToken::new(),
            maintenance: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
            events,
            config,
        })
    }

    // -----------------------------------------------------------------------
    // Intake interface
    // -----------------------------------------------------------------------

    /// Accept a work request: evaluate capacity, then either place it on a
    /// worker, queue it, or reject it softly with backpressure.
    ///
    /// Backpressure is decided before any task record exists, so a rejected
    /// submission leaves no trace and the id in the receipt can be re-used.
    pub fn submit(&self, new_task: NewTask) -> Result<SubmitReceipt> {
        let task_id = new_task
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let queue_depth = self.queue.lock().expect("queue lock poisoned").len();
        let placement = self.supervisor.evaluate(&EvaluateRequest {
            queue_depth,
            priority: new_task.metadata.priority_hint,
            required_capabilities: new_task.metadata.required_capabilities.clone(),
        });

        if let Placement::Backpressure { reason, metrics } = &placement {
            tracing::info!(
                task_id = %task_id,
                %reason,
                saturation = metrics.saturation_ratio,
                queue_depth = metrics.queue_depth,
                "submission rejected with backpressure"
            );
            return Ok(SubmitReceipt {
                task_id,
                outcome: SubmitOutcome::Backpressure {
                    retry_after: self.config.backpressure.cooldown(),
                },
            });
        }

        self.state
            .initialize(&task_id)
            .with_context(|| format!("failed to accept task {task_id}"))?;
        {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            tasks.insert(
                task_id.clone(),
                TaskRecord {
                    payload: new_task.payload,
                    metadata: new_task.metadata.clone(),
                    assigned_worker: None,
                    output: None,
                },
            );
        }
        self.state
            .transition(&task_id, TaskState::Queued, Some("accepted".to_string()), None)
            .with_context(|| format!("failed to queue task {task_id}"))?;

        let outcome = match placement {
            Placement::Assign { worker_id, .. } if self.try_assign(&task_id, &worker_id) => {
                SubmitOutcome::Assigned { worker_id }
            }
            _ => {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                queue.push(new_task.metadata.priority_hint, task_id.clone());
                SubmitOutcome::Queued
            }
        };

        Ok(SubmitReceipt { task_id, outcome })
    }

    /// Current state of a task, or `None` if unknown.
    pub fn status(&self, task_id: &str) -> Option<TaskState> {
        self.state.state(task_id)
    }

    /// Move a task to `cancelled` from any non-terminal state.
    ///
    /// Idempotent: cancelling a cancelled task returns `true` without a new
    /// transition. Returns `false` for unknown tasks and tasks already
    /// completed or failed.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.state.state(task_id) {
            None => false,
            Some(TaskState::Cancelled) => true,
            Some(TaskState::Completed) | Some(TaskState::Failed) => false,
            Some(current) => {
                self.queue
                    .lock()
                    .expect("queue lock poisoned")
                    .remove(task_id);

                if self
                    .state
                    .transition(
                        task_id,
                        TaskState::Cancelled,
                        Some("cancelled by caller".to_string()),
                        None,
                    )
                    .is_err()
                {
                    // Raced with a concurrent transition; report the truth.
                    return self.state.state(task_id) == Some(TaskState::Cancelled);
                }

                let worker = {
                    let mut tasks = self.tasks.lock().expect("task lock poisoned");
                    tasks
                        .get_mut(task_id)
                        .and_then(|record| record.assigned_worker.take())
                };
                if let Some(worker_id) = worker {
                    let _ = self.supervisor.mark_idle(&worker_id);
                }
                self.supervisor.clear_attempts(task_id);

                tracing::info!(task_id, %current, "task cancelled");
                self.dispatch_queued();
                true
            }
        }
    }

    /// Metadata as accepted at intake.
    pub fn task_metadata(&self, task_id: &str) -> Option<TaskMetadata> {
        let tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.get(task_id).map(|r| r.metadata.clone())
    }

    /// The opaque payload as accepted at intake. Immutable after intake.
    pub fn task_payload(&self, task_id: &str) -> Option<serde_json::Value> {
        let tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.get(task_id).map(|r| r.payload.clone())
    }

    /// The output stored for a completed task, if any.
    pub fn task_output(&self, task_id: &str) -> Option<serde_json::Value> {
        let tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.get(task_id).and_then(|r| r.output.clone())
    }

    /// Drop every trace of a terminal task: state history, payload,
    /// snapshots, attempt counters.
    pub async fn purge(&self, task_id: &str) -> Result<()> {
        match self.state.is_terminal(task_id) {
            None => bail!("task {task_id} not found"),
            Some(false) => bail!("task {task_id} is not terminal"),
            Some(true) => {}
        }
        self.state.clear(task_id);
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .remove(task_id);
        self.supervisor.clear_attempts(task_id);
        self.snapshots
            .delete(task_id)
            .await
            .with_context(|| format!("failed to delete snapshots for task {task_id}"))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker control interface
    // -----------------------------------------------------------------------

    /// Register a worker with the registry and the pool, then try to place
    /// queued work on it.
    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<()> {
        let capability_names = registration.capabilities.keys().cloned().collect();
        self.registry
            .register(
                &registration.id,
                registration.capabilities,
                registration.initial_health.unwrap_or(HealthStatus::Healthy),
                registration.initial_saturation.unwrap_or(0.0),
            )
            .await
            .with_context(|| format!("failed to register worker {}", registration.id))?;
        self.supervisor.register(WorkerDescriptor {
            id: registration.id,
            capabilities: capability_names,
        });

        self.dispatch_queued();
        Ok(())
    }

    /// Remove a worker from the registry and the pool. A task the worker
    /// was busy with is not failed here; its fate is decided when the caller
    /// reports the failure.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        self.supervisor.deregister(worker_id);
        self.registry
            .deregister(worker_id)
            .await
            .with_context(|| format!("failed to deregister worker {worker_id}"))?;
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.registry
            .heartbeat(worker_id)
            .await
            .with_context(|| format!("failed to record heartbeat for worker {worker_id}"))
    }

    pub async fn update_health(
        &self,
        worker_id: &str,
        health: HealthStatus,
        saturation: f64,
    ) -> Result<()> {
        self.registry
            .update_health(worker_id, health, saturation)
            .await
            .with_context(|| format!("failed to update health for worker {worker_id}"))
    }

    /// Record a worker's successful output for its running task.
    ///
    /// Output for a cancelled task is discarded. The worker returns to the
    /// idle pool either way.
    pub fn report_result(
        &self,
        worker_id: &str,
        task_id: &str,
        result: WorkerOutput,
    ) -> Result<()> {
        let _ = self.supervisor.mark_idle(worker_id);

        match self.state.state(task_id) {
            None => bail!("task {task_id} not found"),
            Some(TaskState::Cancelled) => {
                tracing::info!(task_id, worker_id, "discarding output for cancelled task");
                self.supervisor.clear_attempts(task_id);
                self.dispatch_queued();
                Ok(())
            }
            Some(TaskState::Running) => {
                self.state
                    .transition(
                        task_id,
                        TaskState::Completed,
                        Some("result reported".to_string()),
                        Some(serde_json::json!({
                            "worker_id": worker_id,
                            "confidence": result.confidence,
                        })),
                    )
                    .with_context(|| format!("failed to complete task {task_id}"))?;

                {
                    let mut tasks = self.tasks.lock().expect("task lock poisoned");
                    if let Some(record) = tasks.get_mut(task_id) {
                        record.assigned_worker = None;
                        record.output = Some(result.output);
                    }
                }
                self.supervisor.clear_attempts(task_id);
                self.dispatch_queued();
                Ok(())
            }
            Some(other) => {
                bail!("cannot record result for task {task_id} in state {other}")
            }
        }
    }

    /// Record a worker fault for its running task: free the worker, fail the
    /// task with the reported `error_type`, and either re-queue it per the
    /// retry plan (persisting a failure snapshot first) or leave it failed
    /// with retries exhausted.
    pub async fn report_failure(
        &self,
        worker_id: &str,
        task_id: &str,
        failure: TaskFailure,
    ) -> Result<RetryPlan> {
        let current = self
            .state
            .state(task_id)
            .with_context(|| format!("task {task_id} not found"))?;

        if current == TaskState::Cancelled {
            // The task was cancelled while the worker was running it; free
            // the worker and retry nothing.
            let _ = self.supervisor.mark_idle(worker_id);
            self.dispatch_queued();
            return Ok(RetryPlan {
                should_retry: false,
                retry_after: Duration::ZERO,
                snapshot: crate::supervisor::FailureSnapshot {
                    task_id: task_id.to_string(),
                    attempt: self.supervisor.attempts(task_id),
                    last_failure_at: chrono::Utc::now(),
                    metadata: serde_json::json!({
                        "error_type": failure.error_type,
                        "worker_id": worker_id,
                    }),
                },
            });
        }
        if current != TaskState::Running {
            bail!("cannot record failure for task {task_id} in state {current}");
        }

        let failure_metadata = serde_json::json!({
            "error_type": failure.error_type,
            "details": failure.details,
        });
        let plan = self
            .supervisor
            .record_failure(worker_id, task_id, failure_metadata);

        self.state
            .transition(
                task_id,
                TaskState::Failed,
                Some(failure.error_type.clone()),
                Some(serde_json::json!({
                    "error_type": failure.error_type,
                    "worker_id": worker_id,
                    "attempt": plan.snapshot.attempt,
                })),
            )
            .with_context(|| format!("failed to fail task {task_id}"))?;
        {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            if let Some(record) = tasks.get_mut(task_id) {
                record.assigned_worker = None;
            }
        }

        if plan.should_retry {
            self.snapshots
                .save(SaveRequest {
                    task_id: task_id.to_string(),
                    data: serde_json::to_value(&plan.snapshot)
                        .context("failed to serialize failure snapshot")?,
                    version: None,
                    ttl: None,
                })
                .await
                .with_context(|| format!("failed to persist failure snapshot for {task_id}"))?;

            self.state
                .transition(
                    task_id,
                    TaskState::Queued,
                    Some("retry".to_string()),
                    Some(serde_json::json!({
                        "attempt": plan.snapshot.attempt,
                        "retry_after_ms": plan.retry_after.as_millis() as u64,
                    })),
                )
                .with_context(|| format!("failed to re-queue task {task_id}"))?;

            self.schedule_requeue(task_id.to_string(), plan.retry_after);
        } else {
            tracing::warn!(
                task_id,
                attempt = plan.snapshot.attempt,
                error_type = %failure.error_type,
                "retries exhausted, task stays failed"
            );
            self.supervisor.clear_attempts(task_id);
        }

        self.dispatch_queued();
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Arbitration interface
    // -----------------------------------------------------------------------

    /// Fold competing pleadings into one decision. Pure pass-through; no
    /// task state is touched.
    pub fn arbitrate(
        &self,
        pleadings: &[PleadingDecision],
        context: &ArbitrationContext,
    ) -> Result<ArbitrationResult, ArbitrationError> {
        self.board.arbitrate(pleadings, context)
    }

    /// Arbitrate competing outputs for a running task and settle the task
    /// from the verdict: approve completes it, deny fails it.
    pub fn settle_with_arbitration(
        &self,
        task_id: &str,
        pleadings: &[PleadingDecision],
        context: &ArbitrationContext,
    ) -> Result<ArbitrationResult> {
        let result = self.board.arbitrate(pleadings, context)?;

        match self.state.state(task_id) {
            None => bail!("task {task_id} not found"),
            Some(TaskState::Running) => {}
            Some(other) => bail!("cannot settle task {task_id} in state {other}"),
        }

        let to = match result.final_decision {
            FinalDecision::Approve => TaskState::Completed,
            FinalDecision::Deny => TaskState::Failed,
        };
        self.state
            .transition(
                task_id,
                to,
                Some(format!("arbitration: {}", result.final_decision)),
                Some(serde_json::json!({
                    "consensus": result.consensus,
                    "confidence": result.confidence,
                    "escalation_required": result.escalation_required,
                    "participants": result.participants,
                })),
            )
            .with_context(|| format!("failed to settle task {task_id}"))?;

        let worker = {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            tasks
                .get_mut(task_id)
                .and_then(|record| record.assigned_worker.take())
        };
        if let Some(worker_id) = worker {
            let _ = self.supervisor.mark_idle(&worker_id);
        }
        self.supervisor.clear_attempts(task_id);
        self.dispatch_queued();
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Component access and lifecycle
    // -----------------------------------------------------------------------

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state_machine(&self) -> &TaskStateMachine {
        &self.state
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn supervisor(&self) -> &PoolSupervisor {
        &self.supervisor
    }

    /// Depth of the dispatch queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Start the background maintenance loops (stale-worker sweep, expired-
    /// snapshot sweep). Idempotent only in the sense that calling it twice
    /// doubles the sweeps; call it once.
    pub fn start_maintenance(&self) {
        let mut handles = self.maintenance.lock().expect("maintenance lock poisoned");
        handles.push(registry::spawn_cleanup(
            Arc::clone(&self.registry),
            self.config.registry.clone(),
            self.cancel.child_token(),
        ));
        handles.push(snapshot::spawn_cleanup(
            Arc::clone(&self.snapshots),
            self.cancel.child_token(),
        ));
    }

    /// Stop the background loops and pending delayed re-queues, then join
    /// them deterministically.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.maintenance.lock().expect("maintenance lock poisoned");
            guard.drain(..).collect()
        };
        let _ = futures::future::join_all(handles).await;
        tracing::info!("orchestrator shut down");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Drive `queued -> assigned -> running` for a placement. Returns false
    /// (leaving the task queued) when the worker was taken or removed
    /// between evaluation and assignment.
    fn try_assign(&self, task_id: &str, worker_id: &str) -> bool {
        if let Err(e) = self.supervisor.mark_busy(worker_id, task_id) {
            tracing::warn!(task_id, worker_id, error = %e, "placement lost its worker");
            return false;
        }

        let assigned = self.state.transition(
            task_id,
            TaskState::Assigned,
            None,
            Some(serde_json::json!({"worker_id": worker_id})),
        );
        if let Err(e) = assigned {
            // The task left `queued` under us (e.g. a concurrent cancel).
            tracing::warn!(task_id, worker_id, error = %e, "assignment aborted");
            let _ = self.supervisor.mark_idle(worker_id);
            return false;
        }
        if let Err(e) = self
            .state
            .transition(task_id, TaskState::Running, None, None)
        {
            tracing::warn!(task_id, worker_id, error = %e, "start aborted");
            let _ = self.supervisor.mark_idle(worker_id);
            return false;
        }

        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        if let Some(record) = tasks.get_mut(task_id) {
            record.assigned_worker = Some(worker_id.to_string());
        }
        tracing::debug!(task_id, worker_id, "task placed on worker");
        true
    }

    /// Drain the queue while placements keep succeeding.
    fn dispatch_queued(&self) {
        loop {
            let Some(task_id) = self.queue.lock().expect("queue lock poisoned").pop() else {
                return;
            };

            // A queue entry can outlive its task's queued state (cancel
            // races the pop); skip anything no longer queued.
            if self.state.state(&task_id) != Some(TaskState::Queued) {
                continue;
            }

            let Some(metadata) = self.task_metadata(&task_id) else {
                continue;
            };

            let queue_depth = self.queue.lock().expect("queue lock poisoned").len();
            let placement = self.supervisor.evaluate(&EvaluateRequest {
                queue_depth,
                priority: metadata.priority_hint,
                required_capabilities: metadata.required_capabilities.clone(),
            });

            match placement {
                Placement::Assign { worker_id, .. } => {
                    if !self.try_assign(&task_id, &worker_id) {
                        self.queue
                            .lock()
                            .expect("queue lock poisoned")
                            .push_front(metadata.priority_hint, task_id);
                        return;
                    }
                }
                Placement::Queue { .. } | Placement::Backpressure { .. } => {
                    self.queue
                        .lock()
                        .expect("queue lock poisoned")
                        .push_front(metadata.priority_hint, task_id);
                    return;
                }
            }
        }
    }

    /// Re-enqueue a task after its retry delay, unless it left the queued
    /// state in the meantime.
    fn schedule_requeue(&self, task_id: String, delay: Duration) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
            if this.state.state(&task_id) != Some(TaskState::Queued) {
                tracing::debug!(task_id = %task_id, "skipping retry re-queue, task moved on");
                return;
            }
            let priority = this
                .task_metadata(&task_id)
                .map(|m| m.priority_hint)
                .unwrap_or(Priority::Normal);
            this.queue
                .lock()
                .expect("queue lock poisoned")
                .push(priority, task_id);
            this.dispatch_queued();
        });
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tasks", &self.state.len())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut queue = DispatchQueue::default();
        queue.push(Priority::Normal, "n1".to_string());
        queue.push(Priority::Low, "l1".to_string());
        queue.push(Priority::Urgent, "u1".to_string());
        queue.push(Priority::Normal, "n2".to_string());
        queue.push(Priority::Urgent, "u2".to_string());

        let drained: Vec<String> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec!["u1", "u2", "n1", "n2", "l1"]);
    }

    #[test]
    fn queue_remove_targets_one_entry() {
        let mut queue = DispatchQueue::default();
        queue.push(Priority::Normal, "a".to_string());
        queue.push(Priority::Normal, "b".to_string());

        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some("b".to_string()));
    }

    #[test]
    fn queue_push_front_preserves_head() {
        let mut queue = DispatchQueue::default();
        queue.push(Priority::Normal, "a".to_string());
        queue.push(Priority::Normal, "b".to_string());
        let head = queue.pop().unwrap();
        queue.push_front(Priority::Normal, head);
        assert_eq!(queue.pop(), Some("a".to_string()));
    }
}
