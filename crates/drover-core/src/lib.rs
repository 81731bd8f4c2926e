//! drover-core: the orchestration kernel of a control plane for fleets of
//! capability-tagged workers.
//!
//! The kernel is a dependency chain of five components, leaves first:
//!
//! 1. [`state::TaskStateMachine`] -- validated task lifecycle transitions
//!    with an append-only history.
//! 2. [`registry::WorkerRegistry`] -- the live worker set with capability,
//!    health, saturation, and heartbeat tracking.
//! 3. [`snapshot::SnapshotStore`] -- versioned, TTL-bounded execution
//!    checkpoints over a pluggable repository.
//! 4. [`supervisor::PoolSupervisor`] -- admission, routing, backpressure,
//!    and retry planning.
//! 5. [`arbitration::ArbitrationBoard`] -- confidence scoring and
//!    arbitration of competing worker outputs.
//!
//! [`orchestrator::Orchestrator`] glues them into the intake, worker
//! control, and arbitration interfaces. Everything the kernel publishes
//! flows through [`event::EventBus`].

pub mod arbitration;
pub mod config;
pub mod event;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod supervisor;
pub mod verify;

pub use config::Config;
pub use event::{Event, EventBus};
pub use model::{
    ArbitrationResult, ConsensusLevel, Decision, FinalDecision, HealthStatus, PleadingDecision,
    Priority, TaskMetadata, TaskState, TaskTransition,
};
pub use orchestrator::Orchestrator;
