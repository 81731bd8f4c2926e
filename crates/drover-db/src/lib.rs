//! drover-db: PostgreSQL repository adapters for the control plane.
//!
//! Implements the core's [`drover_core::registry::WorkerRepository`] and
//! [`drover_core::snapshot::SnapshotRepository`] contracts over sqlx. The
//! snapshot table enforces `UNIQUE (task_id, snapshot_version)` so version
//! races surface as conflicts, and all TTL comparisons run against the
//! database clock.

pub mod config;
pub mod models;
pub mod pool;
pub mod repository;

pub use config::DbConfig;
pub use repository::{PgSnapshotRepository, PgWorkerRepository};
