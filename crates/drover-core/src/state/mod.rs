//! Task state machine: tracks every task's current state, enforces the
//! allowed transition graph, keeps an append-only transition history, and
//! emits events after each state change.
//!
//! The machine holds a single lock for the read-modify-write of state plus
//! history append, so transitions for one task are totally ordered. Events
//! are emitted after the write; a subscriber may observe an event whose
//! state has already been superseded.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::event::{Event, EventBus};
use crate::model::{TaskState, TaskTransition};

/// Errors surfaced by state machine operations. Validation failures are
/// synchronous and never retried.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("illegal transition {from} -> {to} for task {task_id}")]
    IllegalTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },
}

/// Timestamps and transition log for one task, as returned by
/// [`TaskStateMachine::history`].
#[derive(Debug, Clone)]
pub struct TaskHistory {
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<TaskTransition>,
}

#[derive(Debug)]
struct TaskEntry {
    state: TaskState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    transitions: Vec<TaskTransition>,
}

/// In-memory registry of task states with validated transitions.
///
/// The allowed transition graph:
///
/// ```text
/// pending   -> queued | cancelled
/// queued    -> assigned | cancelled
/// assigned  -> running | queued | cancelled
/// running   -> completed | failed | suspended | cancelled
/// suspended -> running | cancelled
/// failed    -> queued   (retry)
/// completed -> (terminal)
/// cancelled -> (terminal)
/// ```
#[derive(Debug)]
pub struct TaskStateMachine {
    inner: RwLock<HashMap<String, TaskEntry>>,
    events: EventBus,
}

/// Check whether `from -> to` is an edge in the transition graph.
pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Cancelled)
            | (Queued, Assigned)
            | (Queued, Cancelled)
            | (Assigned, Running)
            | (Assigned, Queued)
            | (Assigned, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Suspended)
            | (Running, Cancelled)
            | (Suspended, Running)
            | (Suspended, Cancelled)
            | (Failed, Queued)
    )
}

impl TaskStateMachine {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create a task in `pending`.
    pub fn initialize(&self, task_id: &str) -> Result<(), StateError> {
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            if inner.contains_key(task_id) {
                return Err(StateError::AlreadyExists(task_id.to_string()));
            }
            let now = Utc::now();
            inner.insert(
                task_id.to_string(),
                TaskEntry {
                    state: TaskState::Pending,
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    completed_at: None,
                    transitions: Vec::new(),
                },
            );
        }

        tracing::debug!(task_id, "task initialized");
        self.events.emit(Event::TaskInitialized {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Validate and execute a transition, appending it to the task's log.
    ///
    /// Sets `started_at` when the task first enters `running` and
    /// `completed_at` when it enters a terminal state. Returns the recorded
    /// transition. Invalid transitions are rejected and never logged.
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskState,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskTransition, StateError> {
        let (from, transition) = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let entry = inner
                .get_mut(task_id)
                .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;

            let from = entry.state;
            if !is_valid_transition(from, to) {
                return Err(StateError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from,
                    to,
                });
            }

            let now = Utc::now();
            let transition = TaskTransition {
                from,
                to,
                timestamp: now,
                reason,
                metadata,
            };

            entry.state = to;
            entry.updated_at = now;
            if to == TaskState::Running && entry.started_at.is_none() {
                entry.started_at = Some(now);
            }
            if to.is_terminal() {
                entry.completed_at = Some(now);
            }
            entry.transitions.push(transition.clone());

            (from, transition)
        };

        tracing::debug!(task_id, %from, %to, "task transitioned");
        self.events.emit(Event::TaskTransitioned {
            task_id: task_id.to_string(),
            from,
            to,
            transition: transition.clone(),
        });
        self.events.emit(Event::TaskEntered {
            task_id: task_id.to_string(),
            state: to,
            transition: transition.clone(),
        });

        Ok(transition)
    }

    /// Current state of a task, or `None` if unknown.
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner.get(task_id).map(|e| e.state)
    }

    /// Full history view: timestamps plus the transition log.
    pub fn history(&self, task_id: &str) -> Option<TaskHistory> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner.get(task_id).map(|e| TaskHistory {
            state: e.state,
            created_at: e.created_at,
            updated_at: e.updated_at,
            started_at: e.started_at,
            completed_at: e.completed_at,
            transitions: e.transitions.clone(),
        })
    }

    /// Just the transition log, oldest first.
    pub fn transitions(&self, task_id: &str) -> Option<Vec<TaskTransition>> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner.get(task_id).map(|e| e.transitions.clone())
    }

    /// Ids of all tasks currently in `state`, sorted for determinism.
    pub fn tasks_by_state(&self, state: TaskState) -> Vec<String> {
        let inner = self.inner.read().expect("state lock poisoned");
        let mut ids: Vec<String> = inner
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether the task is in a terminal state. `None` if unknown.
    pub fn is_terminal(&self, task_id: &str) -> Option<bool> {
        self.state(task_id).map(TaskState::is_terminal)
    }

    /// Evict a task and its history. Returns whether anything was removed.
    pub fn clear(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.remove(task_id).is_some()
    }

    /// Evict everything.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("state lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> TaskStateMachine {
        TaskStateMachine::new(EventBus::default())
    }

    #[test]
    fn transition_table_edges() {
        use TaskState::*;
        assert!(is_valid_transition(Pending, Queued));
        assert!(is_valid_transition(Pending, Cancelled));
        assert!(is_valid_transition(Queued, Assigned));
        assert!(is_valid_transition(Assigned, Running));
        assert!(is_valid_transition(Assigned, Queued));
        assert!(is_valid_transition(Running, Completed));
        assert!(is_valid_transition(Running, Failed));
        assert!(is_valid_transition(Running, Suspended));
        assert!(is_valid_transition(Suspended, Running));
        assert!(is_valid_transition(Failed, Queued));

        // Terminal states (other than failed -> queued) have no exits.
        assert!(!is_valid_transition(Completed, Queued));
        assert!(!is_valid_transition(Cancelled, Queued));
        assert!(!is_valid_transition(Cancelled, Cancelled));
        // Shortcuts are not edges.
        assert!(!is_valid_transition(Pending, Running));
        assert!(!is_valid_transition(Queued, Running));
        assert!(!is_valid_transition(Failed, Running));
    }

    #[test]
    fn initialize_starts_pending() {
        let m = machine();
        m.initialize("t1").unwrap();
        assert_eq!(m.state("t1"), Some(TaskState::Pending));
        assert!(m.transitions("t1").unwrap().is_empty());
    }

    #[test]
    fn initialize_twice_is_already_exists() {
        let m = machine();
        m.initialize("t1").unwrap();
        let err = m.initialize("t1").unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
        // State is unchanged by the failed call.
        assert_eq!(m.state("t1"), Some(TaskState::Pending));
    }

    #[test]
    fn illegal_transition_rejected_and_unlogged() {
        let m = machine();
        m.initialize("t1").unwrap();
        let err = m
            .transition("t1", TaskState::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(m.state("t1"), Some(TaskState::Pending));
        assert!(m.transitions("t1").unwrap().is_empty());
    }

    #[test]
    fn transition_unknown_task_is_not_found() {
        let m = machine();
        let err = m
            .transition("ghost", TaskState::Queued, None, None)
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn history_tracks_current_state() {
        let m = machine();
        m.initialize("t1").unwrap();
        m.transition("t1", TaskState::Queued, None, None).unwrap();
        m.transition("t1", TaskState::Assigned, None, None).unwrap();
        m.transition("t1", TaskState::Running, None, None).unwrap();
        m.transition("t1", TaskState::Completed, None, None)
            .unwrap();

        let history = m.history("t1").unwrap();
        assert_eq!(history.transitions.len(), 4);
        // The current state equals the last transition's `to`.
        assert_eq!(history.state, history.transitions.last().unwrap().to);
        assert!(history.started_at.is_some());
        assert!(history.completed_at.is_some());
        // Every logged edge is in the allowed table.
        for t in &history.transitions {
            assert!(is_valid_transition(t.from, t.to));
        }
    }

    #[test]
    fn started_at_set_once() {
        let m = machine();
        m.initialize("t1").unwrap();
        m.transition("t1", TaskState::Queued, None, None).unwrap();
        m.transition("t1", TaskState::Assigned, None, None).unwrap();
        m.transition("t1", TaskState::Running, None, None).unwrap();
        let first = m.history("t1").unwrap().started_at.unwrap();

        m.transition("t1", TaskState::Suspended, None, None)
            .unwrap();
        m.transition("t1", TaskState::Running, None, None).unwrap();
        assert_eq!(m.history("t1").unwrap().started_at.unwrap(), first);
    }

    #[test]
    fn retry_edge_failed_to_queued() {
        let m = machine();
        m.initialize("t1").unwrap();
        m.transition("t1", TaskState::Queued, None, None).unwrap();
        m.transition("t1", TaskState::Assigned, None, None).unwrap();
        m.transition("t1", TaskState::Running, None, None).unwrap();
        m.transition("t1", TaskState::Failed, Some("network".to_string()), None)
            .unwrap();
        m.transition("t1", TaskState::Queued, Some("retry".to_string()), None)
            .unwrap();
        assert_eq!(m.state("t1"), Some(TaskState::Queued));
    }

    #[test]
    fn tasks_by_state_sorted() {
        let m = machine();
        m.initialize("b").unwrap();
        m.initialize("a").unwrap();
        m.initialize("c").unwrap();
        m.transition("c", TaskState::Queued, None, None).unwrap();

        assert_eq!(m.tasks_by_state(TaskState::Pending), vec!["a", "b"]);
        assert_eq!(m.tasks_by_state(TaskState::Queued), vec!["c"]);
    }

    #[test]
    fn clear_evicts_history() {
        let m = machine();
        m.initialize("t1").unwrap();
        assert!(m.clear("t1"));
        assert!(!m.clear("t1"));
        assert!(m.state("t1").is_none());
    }

    #[tokio::test]
    async fn events_emitted_after_state_change() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = TaskStateMachine::new(bus);

        m.initialize("t1").unwrap();
        m.transition("t1", TaskState::Queued, None, None).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "task.initialized");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind(), "task.transitioned");
        let third = rx.recv().await.unwrap();
        assert_eq!(third.kind(), "task.queued");
    }
}
