//! sqlx implementations of the core repository contracts.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;

use drover_core::registry::{WorkerInfo, WorkerRepository};
use drover_core::snapshot::{RepositoryError, SnapshotRecord, SnapshotRepository};

use crate::models::{SnapshotRow, WorkerRow};

/// PostgreSQL unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// Worker rows over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgWorkerRepository {
    pool: PgPool,
}

impl PgWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn upsert(&self, worker: &WorkerInfo) -> anyhow::Result<()> {
        let row = WorkerRow::from_info(worker);
        sqlx::query(
            "INSERT INTO workers \
                 (worker_id, capabilities, health_status, saturation_ratio, last_heartbeat, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (worker_id) DO UPDATE SET \
                 capabilities = EXCLUDED.capabilities, \
                 health_status = EXCLUDED.health_status, \
                 saturation_ratio = EXCLUDED.saturation_ratio, \
                 last_heartbeat = EXCLUDED.last_heartbeat",
        )
        .bind(&row.worker_id)
        .bind(&row.capabilities)
        .bind(&row.health_status)
        .bind(row.saturation_ratio)
        .bind(row.last_heartbeat)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert worker {}", worker.id))?;
        Ok(())
    }

    async fn remove(&self, worker_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove worker {worker_id}"))?;
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<WorkerInfo>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers")
            .fetch_all(&self.pool)
            .await
            .context("failed to load workers")?;
        rows.into_iter().map(WorkerRow::into_info).collect()
    }
}

/// Snapshot rows over PostgreSQL. The unique constraint on
/// `(task_id, snapshot_version)` is what makes concurrent saves safe; a
/// violation surfaces as [`RepositoryError::VersionConflict`] so the store
/// can retry with the next version. Liveness is evaluated against `NOW()`
/// on the database, with expiry as a closed interval.
#[derive(Debug, Clone)]
pub struct PgSnapshotRepository {
    pool: PgPool,
}

impl PgSnapshotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for PgSnapshotRepository {
    async fn insert(&self, record: SnapshotRecord) -> Result<SnapshotRecord, RepositoryError> {
        let result = sqlx::query_as::<_, SnapshotRow>(
            "INSERT INTO task_snapshots \
                 (task_id, snapshot_version, snapshot_data, ttl_expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING *",
        )
        .bind(&record.task_id)
        .bind(record.version)
        .bind(&record.data)
        .bind(record.expires_at)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.into()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(RepositoryError::VersionConflict {
                    task_id: record.task_id,
                    version: record.version,
                })
            }
            Err(e) => Err(RepositoryError::Backend(
                anyhow::Error::new(e).context("failed to insert snapshot"),
            )),
        }
    }

    async fn latest_live(
        &self,
        task_id: &str,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM task_snapshots \
             WHERE task_id = $1 AND ttl_expires_at > NOW() \
             ORDER BY snapshot_version DESC \
             LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryError::Backend(anyhow::Error::new(e).context("failed to fetch snapshot"))
        })?;
        Ok(row.map(Into::into))
    }

    async fn max_version(&self, task_id: &str) -> Result<Option<i64>, RepositoryError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(snapshot_version) FROM task_snapshots WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            RepositoryError::Backend(
                anyhow::Error::new(e).context("failed to fetch max snapshot version"),
            )
        })?;
        Ok(version)
    }

    async fn list(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM task_snapshots \
             WHERE task_id = $1 \
             ORDER BY snapshot_version DESC \
             LIMIT $2",
        )
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryError::Backend(anyhow::Error::new(e).context("failed to list snapshots"))
        })?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_task(&self, task_id: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM task_snapshots WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RepositoryError::Backend(
                    anyhow::Error::new(e).context("failed to delete snapshots"),
                )
            })?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self) -> Result<Vec<String>, RepositoryError> {
        let task_ids: Vec<String> = sqlx::query_scalar(
            "WITH removed AS ( \
                 DELETE FROM task_snapshots WHERE ttl_expires_at <= NOW() RETURNING task_id \
             ) \
             SELECT DISTINCT task_id FROM removed ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryError::Backend(
                anyhow::Error::new(e).context("failed to delete expired snapshots"),
            )
        })?;
        Ok(task_ids)
    }

    async fn prune_versions_below(
        &self,
        task_id: &str,
        min_version: i64,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM task_snapshots WHERE task_id = $1 AND snapshot_version < $2",
        )
        .bind(task_id)
        .bind(min_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryError::Backend(
                anyhow::Error::new(e).context("failed to prune snapshot history"),
            )
        })?;
        Ok(result.rows_affected())
    }
}
