//! Task snapshot store: versioned, TTL-bounded checkpoints so a re-queued
//! task can resume from its most recent consistent point.
//!
//! Versions per task are strictly increasing. The backing repository must
//! make inserts atomic on `(task_id, version)`; when an unassigned-version
//! save races, the store retries with the next version. Expiry is a closed
//! interval: a snapshot at exactly its TTL is already expired, and the
//! repository's clock decides.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventBus};

/// How many times an unassigned-version save will retry after losing a
/// version race before giving up.
const VERSION_RACE_RETRIES: u32 = 5;

/// Errors from the repository contract.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("snapshot version {version} already exists for task {task_id}")]
    VersionConflict { task_id: String, version: i64 },

    #[error("snapshot repository unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors surfaced by the store itself.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("progress {0} out of range [0, 1]")]
    InvalidProgress(f64),

    #[error("gave up assigning a snapshot version for task {task_id} after {attempts} conflicts")]
    VersionExhausted { task_id: String, attempts: u32 },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A stored checkpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotRecord {
    pub task_id: String,
    pub version: i64,
    /// Opaque payload; the worker defines the shape.
    pub data: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot descriptor without the potentially large payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMetadata {
    pub task_id: String,
    pub version: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&SnapshotRecord> for SnapshotMetadata {
    fn from(record: &SnapshotRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            version: record.version,
            expires_at: record.expires_at,
            created_at: record.created_at,
        }
    }
}

/// Storage contract for snapshots.
///
/// `insert` must reject duplicate `(task_id, version)` pairs with
/// [`RepositoryError::VersionConflict`]. Liveness filtering (`latest_live`,
/// `delete_expired`) is evaluated against the repository's own clock.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn insert(&self, record: SnapshotRecord) -> Result<SnapshotRecord, RepositoryError>;
    /// Highest-version snapshot whose expiry is still in the future.
    async fn latest_live(&self, task_id: &str) -> Result<Option<SnapshotRecord>, RepositoryError>;
    async fn max_version(&self, task_id: &str) -> Result<Option<i64>, RepositoryError>;
    /// All versions for a task, newest first, capped at `limit`.
    async fn list(&self, task_id: &str, limit: usize)
        -> Result<Vec<SnapshotRecord>, RepositoryError>;
    async fn delete_task(&self, task_id: &str) -> Result<u64, RepositoryError>;
    /// Remove everything past TTL; returns the affected task ids, deduplicated.
    async fn delete_expired(&self) -> Result<Vec<String>, RepositoryError>;
    /// Drop versions strictly below `min_version` for a task.
    async fn prune_versions_below(
        &self,
        task_id: &str,
        min_version: i64,
    ) -> Result<u64, RepositoryError>;
}

/// Store configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub default_ttl_ms: u64,
    /// Versions kept per task; older versions are evicted on insert.
    pub max_snapshots_per_task: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 3_600_000,
            max_snapshots_per_task: 5,
            cleanup_interval_ms: 300_000,
        }
    }
}

impl SnapshotConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// A save request. Version and TTL are optional; the store assigns
/// `max(existing) + 1` and the configured default TTL when omitted.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub task_id: String,
    pub data: serde_json::Value,
    pub version: Option<i64>,
    pub ttl: Option<Duration>,
}

/// Convenience checkpoint wrapper for [`SnapshotStore::save_checkpoint`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Name of the execution stage reached (e.g. `"parsed"`, `"verified"`).
    pub stage: String,
    /// Completion fraction in [0, 1].
    pub progress: f64,
    /// Opaque execution state.
    pub state: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
}

/// Versioned checkpoint store over a [`SnapshotRepository`].
pub struct SnapshotStore {
    repository: Arc<dyn SnapshotRepository>,
    config: SnapshotConfig,
    events: EventBus,
}

impl SnapshotStore {
    pub fn new(
        repository: Arc<dyn SnapshotRepository>,
        config: SnapshotConfig,
        events: EventBus,
    ) -> Self {
        Self {
            repository,
            config,
            events,
        }
    }

    /// Persist a snapshot. When no version is given, assigns the next one;
    /// a concurrent save that wins the race just costs a retry.
    pub async fn save(&self, request: SaveRequest) -> Result<SnapshotRecord, SnapshotError> {
        let ttl = request.ttl.unwrap_or_else(|| self.config.default_ttl());
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.config.default_ttl_ms as i64));

        let stored = if let Some(version) = request.version {
            let record = SnapshotRecord {
                task_id: request.task_id.clone(),
                version,
                data: request.data.clone(),
                expires_at: Utc::now() + ttl,
                created_at: Utc::now(),
            };
            self.repository.insert(record).await?
        } else {
            self.save_next_version(&request, ttl).await?
        };

        self.prune(&stored).await;

        tracing::debug!(
            task_id = %stored.task_id,
            version = stored.version,
            "snapshot saved"
        );
        self.events.emit(Event::SnapshotSaved {
            task_id: stored.task_id.clone(),
            version: stored.version,
        });
        Ok(stored)
    }

    async fn save_next_version(
        &self,
        request: &SaveRequest,
        ttl: chrono::Duration,
    ) -> Result<SnapshotRecord, SnapshotError> {
        for _ in 0..VERSION_RACE_RETRIES {
            let next = self
                .repository
                .max_version(&request.task_id)
                .await?
                .unwrap_or(0)
                + 1;
            let record = SnapshotRecord {
                task_id: request.task_id.clone(),
                version: next,
                data: request.data.clone(),
                expires_at: Utc::now() + ttl,
                created_at: Utc::now(),
            };
            match self.repository.insert(record).await {
                Ok(stored) => return Ok(stored),
                Err(RepositoryError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SnapshotError::VersionExhausted {
            task_id: request.task_id.clone(),
            attempts: VERSION_RACE_RETRIES,
        })
    }

    /// Evict versions beyond the per-task history bound. Best-effort; a
    /// failed prune is logged and the save still counts.
    async fn prune(&self, stored: &SnapshotRecord) {
        let keep = self.config.max_snapshots_per_task as i64;
        let min_version = stored.version - keep + 1;
        if min_version <= 1 {
            return;
        }
        if let Err(e) = self
            .repository
            .prune_versions_below(&stored.task_id, min_version)
            .await
        {
            tracing::warn!(
                task_id = %stored.task_id,
                error = %e,
                "failed to prune snapshot history"
            );
        }
    }

    /// The highest-version non-expired snapshot, or `None`.
    pub async fn restore(&self, task_id: &str) -> Result<Option<SnapshotRecord>, SnapshotError> {
        let record = self.repository.latest_live(task_id).await?;
        if let Some(ref record) = record {
            self.events.emit(Event::SnapshotRestored {
                task_id: task_id.to_string(),
                version: record.version,
            });
        }
        Ok(record)
    }

    /// Persist `new_data` as a fresh version.
    pub async fn update(
        &self,
        task_id: &str,
        new_data: serde_json::Value,
    ) -> Result<SnapshotRecord, SnapshotError> {
        self.save(SaveRequest {
            task_id: task_id.to_string(),
            data: new_data,
            version: None,
            ttl: None,
        })
        .await
    }

    /// All retained versions, newest first.
    pub async fn history(&self, task_id: &str) -> Result<Vec<SnapshotRecord>, SnapshotError> {
        Ok(self
            .repository
            .list(task_id, self.config.max_snapshots_per_task)
            .await?)
    }

    /// Retained version descriptors, newest first, payloads excluded.
    pub async fn metadata(&self, task_id: &str) -> Result<Vec<SnapshotMetadata>, SnapshotError> {
        let records = self.history(task_id).await?;
        Ok(records.iter().map(SnapshotMetadata::from).collect())
    }

    /// Remove all snapshots for a task. Returns the number removed.
    pub async fn delete(&self, task_id: &str) -> Result<u64, SnapshotError> {
        let removed = self.repository.delete_task(task_id).await?;
        if removed > 0 {
            self.events.emit(Event::SnapshotDeleted {
                task_id: task_id.to_string(),
            });
        }
        Ok(removed)
    }

    /// Remove everything past TTL. Returns the affected task ids.
    pub async fn cleanup_expired(&self) -> Result<Vec<String>, SnapshotError> {
        let affected = self.repository.delete_expired().await?;
        if !affected.is_empty() {
            tracing::debug!(tasks = ?affected, "expired snapshots removed");
        }
        Ok(affected)
    }

    /// Wrap a checkpoint into the standard payload shape and save it at the
    /// next version.
    pub async fn save_checkpoint(
        &self,
        task_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<SnapshotRecord, SnapshotError> {
        if !(0.0..=1.0).contains(&checkpoint.progress) || checkpoint.progress.is_nan() {
            return Err(SnapshotError::InvalidProgress(checkpoint.progress));
        }
        let data = serde_json::json!({
            "checkpoint": checkpoint.stage,
            "progress": checkpoint.progress,
            "state": checkpoint.state,
            "metadata": checkpoint.metadata.unwrap_or(serde_json::Value::Null),
            "timestamp": Utc::now(),
        });
        self.save(SaveRequest {
            task_id: task_id.to_string(),
            data,
            version: None,
            ttl: None,
        })
        .await
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("config", &self.config)
            .finish()
    }
}

/// Spawn the periodic expired-snapshot sweep. Stops when `cancel` fires.
pub fn spawn_cleanup(
    store: Arc<SnapshotStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = store.config.cleanup_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.cleanup_expired().await {
                        tracing::warn!(error = %e, "snapshot cleanup sweep failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("snapshot cleanup loop stopped");
                    return;
                }
            }
        }
    })
}
