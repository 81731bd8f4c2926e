//! Row structs for the worker and snapshot tables, with conversions to the
//! core's domain types.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use drover_core::model::HealthStatus;
use drover_core::registry::WorkerInfo;
use drover_core::snapshot::SnapshotRecord;

/// A worker capability row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerRow {
    pub worker_id: String,
    /// JSON object: capability name -> opaque descriptor.
    pub capabilities: serde_json::Value,
    pub health_status: String,
    pub saturation_ratio: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WorkerRow {
    pub fn from_info(info: &WorkerInfo) -> Self {
        Self {
            worker_id: info.id.clone(),
            capabilities: serde_json::Value::Object(
                info.capabilities
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            health_status: info.health.to_string(),
            saturation_ratio: info.saturation,
            last_heartbeat: info.last_heartbeat,
            created_at: info.registered_at,
        }
    }

    pub fn into_info(self) -> Result<WorkerInfo> {
        let health = HealthStatus::from_str(&self.health_status)
            .with_context(|| format!("worker {} has corrupt health status", self.worker_id))?;
        let capabilities: BTreeMap<String, serde_json::Value> = match self.capabilities {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            other => anyhow::bail!(
                "worker {} has non-object capabilities: {other}",
                self.worker_id
            ),
        };
        Ok(WorkerInfo {
            id: self.worker_id,
            capabilities,
            health,
            saturation: self.saturation_ratio,
            last_heartbeat: self.last_heartbeat,
            registered_at: self.created_at,
        })
    }
}

/// A task snapshot row. `(task_id, snapshot_version)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SnapshotRow {
    pub task_id: String,
    pub snapshot_version: i64,
    pub snapshot_data: serde_json::Value,
    pub ttl_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<SnapshotRow> for SnapshotRecord {
    fn from(row: SnapshotRow) -> Self {
        Self {
            task_id: row.task_id,
            version: row.snapshot_version,
            data: row.snapshot_data,
            expires_at: row.ttl_expires_at,
            created_at: row.created_at,
        }
    }
}
