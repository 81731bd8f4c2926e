//! Worker pool supervisor: the scheduling heart.
//!
//! Given a task's capability requirement and the current queue depth, decides
//! assign / queue / backpressure. On worker failure it produces a retry plan
//! with exponential backoff and a resumable failure snapshot. The supervisor
//! never declares failure on its own; worker disappearance is detected by the
//! caller, who invokes [`PoolSupervisor::record_failure`].
//!
//! All state is in-memory behind one mutex; `evaluate` and `record_failure`
//! are O(workers). Idle iteration is in worker-id order so placement is
//! reproducible.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::Priority;

/// Errors surfaced by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker {0} not in pool")]
    UnknownWorker(String),

    #[error("worker {worker_id} already busy with task {task_id}")]
    WorkerBusy { worker_id: String, task_id: String },
}

/// Pool admission thresholds.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Saturation at or above this triggers backpressure.
    pub saturation_ratio: f64,
    /// Queue depth at or above this triggers backpressure.
    pub queue_depth: usize,
    /// Advisory pause for callers told to back off. The supervisor does not
    /// enforce timing.
    pub cooldown_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            saturation_ratio: 0.8,
            queue_depth: 100,
            cooldown_ms: 1_000,
        }
    }
}

impl BackpressureConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Retry schedule: `min(base * 2^(attempt - 1), max)`, up to `max_attempts`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Backoff for the given attempt (1-based), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Ceiling on concurrent busy workers; also the saturation denominator
    /// floor.
    pub max_workers: usize,
    pub backpressure: BackpressureConfig,
    pub retry: RetryConfig,
}

impl SupervisorConfig {
    /// Fallback used when `max_workers` is configured as zero.
    fn effective_max_workers(&self) -> usize {
        self.max_workers.max(1)
    }
}

/// A worker as the supervisor sees it: a capability set plus busy state.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub id: String,
    pub capabilities: BTreeSet<String>,
}

/// Why backpressure is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureReason {
    WorkerSaturation,
    QueueDepth,
}

impl fmt::Display for BackpressureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WorkerSaturation => "worker_saturation",
            Self::QueueDepth => "queue_depth",
        };
        f.write_str(s)
    }
}

/// Pool load observed at evaluation time. Computed fresh on every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolMetrics {
    pub saturation_ratio: f64,
    pub queue_depth: usize,
    pub busy_workers: usize,
    pub total_workers: usize,
}

/// Current backpressure condition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackpressureState {
    pub active: bool,
    pub reason: Option<BackpressureReason>,
    pub since: Option<DateTime<Utc>>,
}

/// What the supervisor wants done with a task.
#[derive(Debug, Clone)]
pub enum Placement {
    /// An idle worker covers all required capabilities.
    Assign {
        worker_id: String,
        metrics: PoolMetrics,
    },
    /// No worker available but the system has headroom.
    Queue { metrics: PoolMetrics },
    /// The caller should back off and re-submit after the cooldown.
    Backpressure {
        reason: BackpressureReason,
        metrics: PoolMetrics,
    },
}

/// Inputs to a placement decision.
#[derive(Debug, Clone)]
pub struct EvaluateRequest {
    pub queue_depth: usize,
    pub priority: Priority,
    pub required_capabilities: BTreeSet<String>,
}

/// Resumable context captured when a failure is recorded.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FailureSnapshot {
    pub task_id: String,
    pub attempt: u32,
    pub last_failure_at: DateTime<Utc>,
    /// Caller-supplied failure metadata (must carry an `error_type` tag)
    /// plus the failing `worker_id`.
    pub metadata: serde_json::Value,
}

/// The supervisor's answer to a recorded failure.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub should_retry: bool,
    /// Zero when retries are exhausted.
    pub retry_after: Duration,
    pub snapshot: FailureSnapshot,
}

#[derive(Debug)]
struct WorkerSlot {
    capabilities: BTreeSet<String>,
    busy_task: Option<String>,
}

#[derive(Debug, Default)]
struct PoolState {
    /// BTreeMap so idle iteration order is worker-id order.
    workers: BTreeMap<String, WorkerSlot>,
    /// Per-task failure counters.
    attempts: HashMap<String, u32>,
    backpressure: BackpressureState,
}

impl PoolState {
    fn busy_count(&self) -> usize {
        self.workers
            .values()
            .filter(|s| s.busy_task.is_some())
            .count()
    }
}

/// The scheduler. See the module docs for the decision rules.
#[derive(Debug)]
pub struct PoolSupervisor {
    inner: Mutex<PoolState>,
    config: SupervisorConfig,
}

impl PoolSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Mutex::new(PoolState::default()),
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Add or replace a worker. A replaced worker keeps its busy task.
    pub fn register(&self, descriptor: WorkerDescriptor) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let busy_task = inner
            .workers
            .get(&descriptor.id)
            .and_then(|s| s.busy_task.clone());
        inner.workers.insert(
            descriptor.id,
            WorkerSlot {
                capabilities: descriptor.capabilities,
                busy_task,
            },
        );
    }

    /// Remove a worker from the pool. Returns whether it was present.
    pub fn deregister(&self, worker_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.workers.remove(worker_id).is_some()
    }

    /// Move a worker to the busy partition.
    pub fn mark_busy(&self, worker_id: &str, task_id: &str) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let slot = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SupervisorError::UnknownWorker(worker_id.to_string()))?;
        if let Some(existing) = &slot.busy_task {
            return Err(SupervisorError::WorkerBusy {
                worker_id: worker_id.to_string(),
                task_id: existing.clone(),
            });
        }
        slot.busy_task = Some(task_id.to_string());
        Ok(())
    }

    /// Return a worker to the idle partition. Idempotent for idle workers.
    pub fn mark_idle(&self, worker_id: &str) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let slot = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SupervisorError::UnknownWorker(worker_id.to_string()))?;
        slot.busy_task = None;
        Ok(())
    }

    /// The task a worker is currently busy with, if any.
    pub fn busy_task(&self, worker_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .workers
            .get(worker_id)
            .and_then(|s| s.busy_task.clone())
    }

    /// Decide assign / queue / backpressure for a task.
    ///
    /// The first idle worker (in id order) covering all required
    /// capabilities wins. Backpressure is only considered when no worker is
    /// eligible: saturation first, then queue depth. An assign clears any
    /// active backpressure.
    pub fn evaluate(&self, request: &EvaluateRequest) -> Placement {
        let mut inner = self.inner.lock().expect("pool lock poisoned");

        let total = inner.workers.len();
        let busy = inner.busy_count();
        let saturation =
            busy as f64 / total.max(self.config.effective_max_workers()) as f64;
        let metrics = PoolMetrics {
            saturation_ratio: saturation,
            queue_depth: request.queue_depth,
            busy_workers: busy,
            total_workers: total,
        };

        let eligible = inner
            .workers
            .iter()
            .find(|(_, slot)| {
                slot.busy_task.is_none()
                    && request
                        .required_capabilities
                        .iter()
                        .all(|c| slot.capabilities.contains(c))
            })
            .map(|(id, _)| id.clone());

        if let Some(worker_id) = eligible {
            inner.backpressure = BackpressureState::default();
            tracing::debug!(
                worker_id = %worker_id,
                priority = %request.priority,
                saturation,
                "placement: assign"
            );
            return Placement::Assign { worker_id, metrics };
        }

        let reason = if saturation >= self.config.backpressure.saturation_ratio {
            Some(BackpressureReason::WorkerSaturation)
        } else if request.queue_depth >= self.config.backpressure.queue_depth {
            Some(BackpressureReason::QueueDepth)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                if !inner.backpressure.active {
                    inner.backpressure = BackpressureState {
                        active: true,
                        reason: Some(reason),
                        since: Some(Utc::now()),
                    };
                } else {
                    inner.backpressure.reason = Some(reason);
                }
                tracing::debug!(%reason, saturation, queue_depth = request.queue_depth, "placement: backpressure");
                Placement::Backpressure { reason, metrics }
            }
            None => {
                tracing::debug!(saturation, queue_depth = request.queue_depth, "placement: queue");
                Placement::Queue { metrics }
            }
        }
    }

    /// Record a worker failure: free the worker, bump the task's attempt
    /// counter, and compute the retry plan.
    pub fn record_failure(
        &self,
        worker_id: &str,
        task_id: &str,
        failure_metadata: serde_json::Value,
    ) -> RetryPlan {
        let mut inner = self.inner.lock().expect("pool lock poisoned");

        // The worker may already be evicted; freeing it is best-effort.
        if let Some(slot) = inner.workers.get_mut(worker_id) {
            slot.busy_task = None;
        }

        let attempt = {
            let counter = inner.attempts.entry(task_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let mut metadata = match failure_metadata {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("details".to_string(), other);
                map
            }
        };
        metadata.insert(
            "worker_id".to_string(),
            serde_json::Value::String(worker_id.to_string()),
        );

        let should_retry = attempt <= self.config.retry.max_attempts;
        let retry_after = if should_retry {
            self.config.retry.delay_for_attempt(attempt)
        } else {
            Duration::ZERO
        };

        tracing::info!(
            worker_id,
            task_id,
            attempt,
            should_retry,
            retry_after_ms = retry_after.as_millis() as u64,
            "worker failure recorded"
        );

        RetryPlan {
            should_retry,
            retry_after,
            snapshot: FailureSnapshot {
                task_id: task_id.to_string(),
                attempt,
                last_failure_at: Utc::now(),
                metadata: serde_json::Value::Object(metadata),
            },
        }
    }

    /// Attempts recorded so far for a task.
    pub fn attempts(&self, task_id: &str) -> u32 {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner.attempts.get(task_id).copied().unwrap_or(0)
    }

    /// Drop a task's attempt counter (on completion or cancellation).
    pub fn clear_attempts(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.attempts.remove(task_id);
    }

    /// Current backpressure condition.
    pub fn backpressure_state(&self) -> BackpressureState {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner.backpressure
    }

    /// Fresh load metrics without a placement decision.
    pub fn metrics(&self, queue_depth: usize) -> PoolMetrics {
        let inner = self.inner.lock().expect("pool lock poisoned");
        let total = inner.workers.len();
        let busy = inner.busy_count();
        PoolMetrics {
            saturation_ratio: busy as f64
                / total.max(self.config.effective_max_workers()) as f64,
            queue_depth,
            busy_workers: busy,
            total_workers: total,
        }
    }
}
