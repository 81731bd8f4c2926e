//! Event plumbing: a typed event sum published on a bounded broadcast
//! channel.
//!
//! Emission is fire-and-forget. A slow subscriber lags and loses the oldest
//! events rather than back-propagating to the emitter; a missing subscriber
//! costs nothing. State changes are never rolled back because an event could
//! not be delivered.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::model::{HealthStatus, TaskState, TaskTransition};

/// Default broadcast buffer size.
const DEFAULT_CAPACITY: usize = 256;

/// Everything the control plane publishes, as one sum type.
#[derive(Debug, Clone)]
pub enum Event {
    TaskInitialized {
        task_id: String,
    },
    TaskTransitioned {
        task_id: String,
        from: TaskState,
        to: TaskState,
        transition: TaskTransition,
    },
    /// State-specific companion to [`Event::TaskTransitioned`]; its kind
    /// renders as `task.<state>`.
    TaskEntered {
        task_id: String,
        state: TaskState,
        transition: TaskTransition,
    },
    WorkerRegistered {
        worker_id: String,
        capabilities: Vec<String>,
    },
    WorkerDeregistered {
        worker_id: String,
    },
    WorkerHealthUpdated {
        worker_id: String,
        health: HealthStatus,
        saturation: f64,
    },
    WorkerCleanup {
        stale_worker_ids: Vec<String>,
    },
    SnapshotSaved {
        task_id: String,
        version: i64,
    },
    SnapshotRestored {
        task_id: String,
        version: i64,
    },
    SnapshotDeleted {
        task_id: String,
    },
}

impl Event {
    /// Stable dotted identifier for the event, e.g. `task.transitioned` or
    /// `worker.registered`. `TaskEntered` renders the state name into the
    /// kind (`task.running`, `task.completed`, ...).
    pub fn kind(&self) -> String {
        match self {
            Self::TaskInitialized { .. } => "task.initialized".to_string(),
            Self::TaskTransitioned { .. } => "task.transitioned".to_string(),
            Self::TaskEntered { state, .. } => format!("task.{state}"),
            Self::WorkerRegistered { .. } => "worker.registered".to_string(),
            Self::WorkerDeregistered { .. } => "worker.deregistered".to_string(),
            Self::WorkerHealthUpdated { .. } => "worker.health_updated".to_string(),
            Self::WorkerCleanup { .. } => "worker.cleanup".to_string(),
            Self::SnapshotSaved { .. } => "snapshot.saved".to_string(),
            Self::SnapshotRestored { .. } => "snapshot.restored".to_string(),
            Self::SnapshotDeleted { .. } => "snapshot.deleted".to_string(),
        }
    }
}

/// Shared handle for publishing and subscribing to [`Event`]s.
///
/// Cloning is cheap; all clones feed the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Best-effort: an error here means no subscriber is
    /// listening, which is fine.
    pub fn emit(&self, event: Event) {
        tracing::trace!(kind = %event.kind(), "emitting event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, for consumers that prefer stream combinators.
    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
