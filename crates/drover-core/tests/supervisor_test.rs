//! Integration tests for the pool supervisor's placement and retry
//! behavior under the documented boundary conditions.

use std::time::Duration;

use drover_core::model::Priority;
use drover_core::supervisor::{
    BackpressureConfig, BackpressureReason, EvaluateRequest, Placement, PoolSupervisor,
    RetryConfig, SupervisorConfig, WorkerDescriptor,
};

fn config() -> SupervisorConfig {
    SupervisorConfig {
        max_workers: 4,
        backpressure: BackpressureConfig {
            saturation_ratio: 0.8,
            queue_depth: 100,
            cooldown_ms: 1_000,
        },
        retry: RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 3,
        },
    }
}

fn worker(id: &str, capabilities: &[&str]) -> WorkerDescriptor {
    WorkerDescriptor {
        id: id.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}

fn request(queue_depth: usize, capabilities: &[&str]) -> EvaluateRequest {
    EvaluateRequest {
        queue_depth,
        priority: Priority::Normal,
        required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}

#[test]
fn saturated_pool_reports_backpressure_with_metrics() {
    let supervisor = PoolSupervisor::new(config());
    for i in 1..=4 {
        let id = format!("w{i}");
        supervisor.register(worker(&id, &["code"]));
        supervisor.mark_busy(&id, &format!("t{i}")).unwrap();
    }

    let placement = supervisor.evaluate(&request(0, &["code"]));
    let Placement::Backpressure { reason, metrics } = placement else {
        panic!("expected backpressure, got {placement:?}");
    };
    assert_eq!(reason, BackpressureReason::WorkerSaturation);
    assert_eq!(metrics.saturation_ratio, 1.0);
    assert_eq!(metrics.queue_depth, 0);
    assert_eq!(metrics.busy_workers, 4);
    assert_eq!(metrics.total_workers, 4);

    let state = supervisor.backpressure_state();
    assert!(state.active);
    assert_eq!(state.reason, Some(BackpressureReason::WorkerSaturation));
}

#[test]
fn partial_saturation_past_threshold_still_backpressures() {
    // 3 of 4 busy with max_workers 4 is 0.75, under the 0.8 ratio; the
    // fourth busy worker tips it over.
    let supervisor = PoolSupervisor::new(config());
    for i in 1..=4 {
        supervisor.register(worker(&format!("w{i}"), &["code"]));
    }
    for i in 1..=3 {
        supervisor
            .mark_busy(&format!("w{i}"), &format!("t{i}"))
            .unwrap();
    }

    // One idle worker left: tasks needing a capability it lacks queue
    // rather than backpressure (saturation 0.75 < 0.8).
    let placement = supervisor.evaluate(&request(0, &["math"]));
    assert!(matches!(placement, Placement::Queue { .. }));

    supervisor.mark_busy("w4", "t4").unwrap();
    let placement = supervisor.evaluate(&request(0, &["math"]));
    assert!(matches!(placement, Placement::Backpressure { .. }));
}

#[test]
fn retry_plan_sequence_end_to_end() {
    let supervisor = PoolSupervisor::new(config());
    supervisor.register(worker("w1", &["code"]));

    let metadata = serde_json::json!({"error_type": "network"});

    let plan = supervisor.record_failure("w1", "t1", metadata.clone());
    assert!(plan.should_retry);
    assert_eq!(plan.retry_after, Duration::from_millis(100));
    assert_eq!(plan.snapshot.attempt, 1);

    let plan = supervisor.record_failure("w1", "t1", metadata.clone());
    assert!(plan.should_retry);
    assert_eq!(plan.retry_after, Duration::from_millis(200));
    assert_eq!(plan.snapshot.attempt, 2);

    let plan = supervisor.record_failure("w1", "t1", metadata.clone());
    assert!(plan.should_retry);
    assert_eq!(plan.retry_after, Duration::from_millis(400));
    assert_eq!(plan.snapshot.attempt, 3);

    let plan = supervisor.record_failure("w1", "t1", metadata);
    assert!(!plan.should_retry);
    assert_eq!(plan.retry_after, Duration::ZERO);
    assert_eq!(plan.snapshot.attempt, 4);
}

#[test]
fn attempt_counters_are_per_task() {
    let supervisor = PoolSupervisor::new(config());
    supervisor.register(worker("w1", &[]));

    let metadata = serde_json::json!({"error_type": "oom"});
    supervisor.record_failure("w1", "t1", metadata.clone());
    supervisor.record_failure("w1", "t1", metadata.clone());
    let plan = supervisor.record_failure("w1", "t2", metadata);

    assert_eq!(supervisor.attempts("t1"), 2);
    assert_eq!(plan.snapshot.attempt, 1);
}

#[test]
fn failure_snapshot_carries_task_and_worker() {
    let supervisor = PoolSupervisor::new(config());
    supervisor.register(worker("w1", &[]));

    let plan = supervisor.record_failure(
        "w1",
        "t1",
        serde_json::json!({"error_type": "timeout", "details": {"elapsed_ms": 30000}}),
    );
    assert_eq!(plan.snapshot.task_id, "t1");
    assert_eq!(plan.snapshot.metadata["worker_id"], "w1");
    assert_eq!(plan.snapshot.metadata["error_type"], "timeout");
    assert_eq!(plan.snapshot.metadata["details"]["elapsed_ms"], 30000);
}

#[test]
fn deregistered_worker_failure_still_plans() {
    // The worker vanished (evicted as stale) while its task was running;
    // the caller still records the failure and gets a plan.
    let supervisor = PoolSupervisor::new(config());
    supervisor.register(worker("w1", &["code"]));
    supervisor.mark_busy("w1", "t1").unwrap();
    assert!(supervisor.deregister("w1"));

    let plan = supervisor.record_failure("w1", "t1", serde_json::json!({"error_type": "lost"}));
    assert!(plan.should_retry);
    assert_eq!(plan.snapshot.attempt, 1);
}
