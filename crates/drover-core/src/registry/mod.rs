//! Worker capability registry: the live set of workers, their declared
//! capabilities, health, load, and liveness.
//!
//! The registry is in-memory and answers capability-constrained queries for
//! the scheduler. When constructed with a [`WorkerRepository`], mutations are
//! written through so a restarted control plane can rebuild its live set;
//! repository errors surface to the caller rather than being swallowed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventBus};
use crate::model::HealthStatus;

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("saturation {0} out of range [0, 1]")]
    InvalidSaturation(f64),

    #[error("worker {0} not registered")]
    UnknownWorker(String),

    #[error("worker repository error: {0}")]
    Repository(#[source] anyhow::Error),
}

/// A registered worker as seen by the registry and its consumers.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    /// Capability name -> opaque descriptor. The registry only matches on
    /// the names; descriptors are for the workers' own protocols.
    pub capabilities: BTreeMap<String, serde_json::Value>,
    pub health: HealthStatus,
    /// Fraction of the worker's capacity in use, in [0, 1].
    pub saturation: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    /// Whether this worker declares every capability in `required`.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|c| self.capabilities.contains_key(c))
    }
}

/// Durable storage for worker rows. Single-row upserts and full scans are
/// all the registry needs.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn upsert(&self, worker: &WorkerInfo) -> anyhow::Result<()>;
    async fn remove(&self, worker_id: &str) -> anyhow::Result<()>;
    async fn load_all(&self) -> anyhow::Result<Vec<WorkerInfo>>;
}

/// A capability-constrained worker query.
#[derive(Debug, Clone)]
pub struct WorkerQuery {
    /// Every listed capability must be declared by the worker.
    pub required_capabilities: BTreeSet<String>,
    /// Workers with saturation strictly above this are excluded.
    pub max_saturation: f64,
    /// Workers below this health level are excluded
    /// (`unhealthy < degraded < healthy`).
    pub min_health: HealthStatus,
    /// Cap on the number of returned workers.
    pub limit: Option<usize>,
}

impl Default for WorkerQuery {
    fn default() -> Self {
        Self {
            required_capabilities: BTreeSet::new(),
            max_saturation: 1.0,
            min_health: HealthStatus::Unhealthy,
            limit: None,
        }
    }
}

/// Timing knobs for the registry's background maintenance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often the stale-worker sweep runs.
    pub cleanup_interval_ms: u64,
    /// Workers whose last heartbeat is older than this are evicted.
    /// Default is 5x a typical 60s heartbeat period.
    pub default_stale_threshold_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 60_000,
            default_stale_threshold_ms: 300_000,
        }
    }
}

impl RegistryConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.default_stale_threshold_ms)
    }
}

/// The live worker set.
pub struct WorkerRegistry {
    inner: RwLock<HashMap<String, WorkerInfo>>,
    repository: Option<Arc<dyn WorkerRepository>>,
    events: EventBus,
}

impl WorkerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            repository: None,
            events,
        }
    }

    /// A registry that writes worker rows through to durable storage.
    pub fn with_repository(events: EventBus, repository: Arc<dyn WorkerRepository>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            repository: Some(repository),
            events,
        }
    }

    /// Rebuild the in-memory set from the repository. Returns the number of
    /// workers restored.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let Some(repo) = &self.repository else {
            return Ok(0);
        };
        let workers = repo.load_all().await.map_err(RegistryError::Repository)?;
        let count = workers.len();
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for worker in workers {
            inner.insert(worker.id.clone(), worker);
        }
        tracing::info!(count, "restored workers from repository");
        Ok(count)
    }

    /// Upsert a worker. Sets `last_heartbeat` to now.
    pub async fn register(
        &self,
        worker_id: &str,
        capabilities: BTreeMap<String, serde_json::Value>,
        initial_health: HealthStatus,
        initial_saturation: f64,
    ) -> Result<(), RegistryError> {
        validate_saturation(initial_saturation)?;

        let now = Utc::now();
        let worker = WorkerInfo {
            id: worker_id.to_string(),
            capabilities,
            health: initial_health,
            saturation: initial_saturation,
            last_heartbeat: now,
            registered_at: now,
        };

        self.persist(&worker).await?;

        let capability_names: Vec<String> = worker.capabilities.keys().cloned().collect();
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            inner.insert(worker_id.to_string(), worker);
        }

        tracing::info!(worker_id, ?capability_names, "worker registered");
        self.events.emit(Event::WorkerRegistered {
            worker_id: worker_id.to_string(),
            capabilities: capability_names,
        });
        Ok(())
    }

    /// Remove a worker. Idempotent: removing an unknown worker is a no-op
    /// and emits nothing.
    pub async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            inner.remove(worker_id).is_some()
        };
        if !removed {
            return Ok(());
        }

        if let Some(repo) = &self.repository {
            repo.remove(worker_id)
                .await
                .map_err(RegistryError::Repository)?;
        }

        tracing::info!(worker_id, "worker deregistered");
        self.events.emit(Event::WorkerDeregistered {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    /// Update health and saturation together.
    pub async fn update_health(
        &self,
        worker_id: &str,
        health: HealthStatus,
        saturation: f64,
    ) -> Result<(), RegistryError> {
        validate_saturation(saturation)?;

        let worker = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let worker = inner
                .get_mut(worker_id)
                .ok_or_else(|| RegistryError::UnknownWorker(worker_id.to_string()))?;
            worker.health = health;
            worker.saturation = saturation;
            worker.clone()
        };

        self.persist(&worker).await?;

        tracing::debug!(worker_id, %health, saturation, "worker health updated");
        self.events.emit(Event::WorkerHealthUpdated {
            worker_id: worker_id.to_string(),
            health,
            saturation,
        });
        Ok(())
    }

    /// Record a liveness ping.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), RegistryError> {
        let worker = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let worker = inner
                .get_mut(worker_id)
                .ok_or_else(|| RegistryError::UnknownWorker(worker_id.to_string()))?;
            worker.last_heartbeat = Utc::now();
            worker.clone()
        };
        self.persist(&worker).await
    }

    /// Point-in-time copy of one worker.
    pub fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.get(worker_id).cloned()
    }

    /// Workers satisfying all of the query's constraints, ordered by
    /// ascending saturation, then most-recent heartbeat, then id.
    pub fn query(&self, query: &WorkerQuery) -> Vec<WorkerInfo> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut matches: Vec<WorkerInfo> = inner
            .values()
            .filter(|w| w.covers(&query.required_capabilities))
            .filter(|w| w.saturation <= query.max_saturation)
            .filter(|w| w.health >= query.min_health)
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            a.saturation
                .total_cmp(&b.saturation)
                .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        matches
    }

    /// Remove workers whose last heartbeat is older than `stale_threshold`.
    /// Returns the removed ids. Idempotent.
    pub async fn cleanup_stale(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<String>, RegistryError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let stale: Vec<String> = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let ids: Vec<String> = inner
                .values()
                .filter(|w| w.last_heartbeat < cutoff)
                .map(|w| w.id.clone())
                .collect();
            for id in &ids {
                inner.remove(id);
            }
            ids
        };

        if stale.is_empty() {
            return Ok(stale);
        }

        if let Some(repo) = &self.repository {
            for id in &stale {
                repo.remove(id).await.map_err(RegistryError::Repository)?;
            }
        }

        tracing::warn!(stale_workers = ?stale, "evicted stale workers");
        self.events.emit(Event::WorkerCleanup {
            stale_worker_ids: stale.clone(),
        });
        Ok(stale)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn persist(&self, worker: &WorkerInfo) -> Result<(), RegistryError> {
        if let Some(repo) = &self.repository {
            repo.upsert(worker).await.map_err(RegistryError::Repository)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("registry lock poisoned");
        f.debug_struct("WorkerRegistry")
            .field("workers", &inner.keys().collect::<Vec<_>>())
            .field("durable", &self.repository.is_some())
            .finish()
    }
}

fn validate_saturation(saturation: f64) -> Result<(), RegistryError> {
    if !(0.0..=1.0).contains(&saturation) || saturation.is_nan() {
        return Err(RegistryError::InvalidSaturation(saturation));
    }
    Ok(())
}

/// Spawn the periodic stale-worker sweep. The loop stops when `cancel` fires;
/// join the returned handle for a deterministic shutdown.
pub fn spawn_cleanup(
    registry: Arc<WorkerRegistry>,
    config: RegistryConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = registry.cleanup_stale(config.stale_threshold()).await {
                        tracing::warn!(error = %e, "stale-worker sweep failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("registry cleanup loop stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> BTreeMap<String, serde_json::Value> {
        names
            .iter()
            .map(|n| (n.to_string(), serde_json::json!({})))
            .collect()
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(EventBus::default())
    }

    #[tokio::test]
    async fn register_and_get() {
        let r = registry();
        r.register("w1", caps(&["code"]), HealthStatus::Healthy, 0.0)
            .await
            .unwrap();

        let worker = r.get("w1").expect("registered");
        assert_eq!(worker.health, HealthStatus::Healthy);
        assert!(worker.covers(&BTreeSet::from(["code".to_string()])));
    }

    #[tokio::test]
    async fn register_rejects_bad_saturation() {
        let r = registry();
        let err = r
            .register("w1", caps(&[]), HealthStatus::Healthy, 1.5)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSaturation(_)));
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let r = registry();
        r.register("w1", caps(&["code"]), HealthStatus::Healthy, 0.0)
            .await
            .unwrap();
        r.deregister("w1").await.unwrap();
        r.deregister("w1").await.unwrap();
        r.register("w1", caps(&["code"]), HealthStatus::Healthy, 0.0)
            .await
            .unwrap();
        assert_eq!(r.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_errors() {
        let r = registry();
        let err = r.heartbeat("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn query_filters_capabilities() {
        let r = registry();
        r.register("w1", caps(&["code"]), HealthStatus::Healthy, 0.1)
            .await
            .unwrap();
        r.register("w2", caps(&["code", "math"]), HealthStatus::Healthy, 0.2)
            .await
            .unwrap();

        let query = WorkerQuery {
            required_capabilities: BTreeSet::from(["code".to_string(), "math".to_string()]),
            ..Default::default()
        };
        let matches = r.query(&query);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "w2");
    }

    #[tokio::test]
    async fn query_filters_saturation_and_health() {
        let r = registry();
        r.register("busy", caps(&["code"]), HealthStatus::Healthy, 0.9)
            .await
            .unwrap();
        r.register("sick", caps(&["code"]), HealthStatus::Unhealthy, 0.1)
            .await
            .unwrap();
        r.register("good", caps(&["code"]), HealthStatus::Degraded, 0.3)
            .await
            .unwrap();

        let query = WorkerQuery {
            required_capabilities: BTreeSet::from(["code".to_string()]),
            max_saturation: 0.8,
            min_health: HealthStatus::Degraded,
            limit: None,
        };
        let matches = r.query(&query);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "good");
    }

    #[tokio::test]
    async fn query_orders_by_saturation_then_id() {
        let r = registry();
        r.register("w3", caps(&["code"]), HealthStatus::Healthy, 0.5)
            .await
            .unwrap();
        r.register("w2", caps(&["code"]), HealthStatus::Healthy, 0.1)
            .await
            .unwrap();
        r.register("w1", caps(&["code"]), HealthStatus::Healthy, 0.1)
            .await
            .unwrap();
        // Same saturation, same heartbeat granularity is possible; force the
        // heartbeat tiebreak to be equal by pinning timestamps.
        {
            let mut inner = r.inner.write().unwrap();
            let now = Utc::now();
            for w in inner.values_mut() {
                w.last_heartbeat = now;
            }
        }

        let ids: Vec<String> = r
            .query(&WorkerQuery::default())
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn query_limit_caps_results() {
        let r = registry();
        for i in 0..5 {
            r.register(&format!("w{i}"), caps(&["code"]), HealthStatus::Healthy, 0.0)
                .await
                .unwrap();
        }
        let query = WorkerQuery {
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(r.query(&query).len(), 2);
    }

    #[tokio::test]
    async fn cleanup_stale_removes_old_heartbeats() {
        let r = registry();
        r.register("fresh", caps(&[]), HealthStatus::Healthy, 0.0)
            .await
            .unwrap();
        r.register("stale", caps(&[]), HealthStatus::Healthy, 0.0)
            .await
            .unwrap();
        {
            let mut inner = r.inner.write().unwrap();
            inner.get_mut("stale").unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(600);
        }

        let removed = r
            .cleanup_stale(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(removed, vec!["stale"]);
        assert_eq!(r.len(), 1);

        // Idempotent: nothing left to evict.
        let removed = r
            .cleanup_stale(Duration::from_secs(300))
            .await
            .unwrap();
        assert!(removed.is_empty());
    }
}
