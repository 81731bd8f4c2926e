//! In-memory snapshot repository: the default backend for tests and
//! single-process deployments without durable storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{RepositoryError, SnapshotRecord, SnapshotRepository};

/// Keeps every task's snapshots in a version-sorted vector behind one mutex.
/// The mutex gives the same atomicity on `(task_id, version)` that the SQL
/// backend gets from its unique constraint.
#[derive(Debug, Default)]
pub struct MemorySnapshotRepository {
    inner: Mutex<HashMap<String, Vec<SnapshotRecord>>>,
}

impl MemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn insert(&self, record: SnapshotRecord) -> Result<SnapshotRecord, RepositoryError> {
        let mut inner = self.inner.lock().expect("snapshot lock poisoned");
        let versions = inner.entry(record.task_id.clone()).or_default();
        if versions.iter().any(|r| r.version == record.version) {
            return Err(RepositoryError::VersionConflict {
                task_id: record.task_id,
                version: record.version,
            });
        }
        versions.push(record.clone());
        versions.sort_by_key(|r| r.version);
        Ok(record)
    }

    async fn latest_live(
        &self,
        task_id: &str,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("snapshot lock poisoned");
        Ok(inner.get(task_id).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|r| r.expires_at > now)
                .cloned()
        }))
    }

    async fn max_version(&self, task_id: &str) -> Result<Option<i64>, RepositoryError> {
        let inner = self.inner.lock().expect("snapshot lock poisoned");
        Ok(inner
            .get(task_id)
            .and_then(|versions| versions.last().map(|r| r.version)))
    }

    async fn list(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>, RepositoryError> {
        let inner = self.inner.lock().expect("snapshot lock poisoned");
        Ok(inner
            .get(task_id)
            .map(|versions| versions.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_task(&self, task_id: &str) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().expect("snapshot lock poisoned");
        Ok(inner.remove(task_id).map(|v| v.len() as u64).unwrap_or(0))
    }

    async fn delete_expired(&self) -> Result<Vec<String>, RepositoryError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("snapshot lock poisoned");
        let mut affected = Vec::new();
        for (task_id, versions) in inner.iter_mut() {
            let before = versions.len();
            versions.retain(|r| r.expires_at > now);
            if versions.len() < before {
                affected.push(task_id.clone());
            }
        }
        inner.retain(|_, versions| !versions.is_empty());
        affected.sort();
        Ok(affected)
    }

    async fn prune_versions_below(
        &self,
        task_id: &str,
        min_version: i64,
    ) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().expect("snapshot lock poisoned");
        let Some(versions) = inner.get_mut(task_id) else {
            return Ok(0);
        };
        let before = versions.len();
        versions.retain(|r| r.version >= min_version);
        Ok((before - versions.len()) as u64)
    }
}
