//! Configuration: the full knob surface as nested TOML-friendly sections
//! with the defaults baked in.
//!
//! Resolution chain: explicit path > `DROVER_CONFIG` env var > defaults.
//! Every section is optional; an empty file yields the default config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::arbitration::ArbitrationConfig;
use crate::arbitration::scorer::ScorerConfig;
use crate::registry::RegistryConfig;
use crate::snapshot::SnapshotConfig;
use crate::supervisor::{BackpressureConfig, RetryConfig, SupervisorConfig};

/// Env var naming a config file when no explicit path is given.
pub const CONFIG_ENV: &str = "DROVER_CONFIG";

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ceiling on concurrent busy workers; denominator floor for the
    /// saturation metric.
    pub max_workers: usize,
    pub backpressure: BackpressureConfig,
    pub retry: RetryConfig,
    pub snapshot: SnapshotConfig,
    pub registry: RegistryConfig,
    pub arbitration: ArbitrationConfig,
    pub scorer: ScorerConfig,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 4,
            backpressure: BackpressureConfig::default(),
            retry: RetryConfig::default(),
            snapshot: SnapshotConfig::default(),
            registry: RegistryConfig::default(),
            arbitration: ArbitrationConfig::default(),
            scorer: ScorerConfig::default(),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// The supervisor's slice of the configuration.
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_workers: self.max_workers,
            backpressure: self.backpressure.clone(),
            retry: self.retry.clone(),
        }
    }

    /// Parse a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config")
    }

    /// Load from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    /// Resolve configuration: explicit path > `DROVER_CONFIG` > defaults.
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(&PathBuf::from(env_path));
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.backpressure.saturation_ratio, 0.8);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 1_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.snapshot.default_ttl_ms, 3_600_000);
        assert_eq!(config.snapshot.max_snapshots_per_task, 5);
        assert_eq!(config.registry.cleanup_interval_ms, 60_000);
        assert_eq!(config.registry.default_stale_threshold_ms, 300_000);
        assert_eq!(config.arbitration.min_participants, 3);
        assert_eq!(config.arbitration.escalation_threshold, 0.3);
        assert_eq!(config.scorer.weights.verification_success_rate, 0.40);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.max_workers, Config::default().max_workers);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = Config::from_toml_str(
            r#"
            max_workers = 16

            [backpressure]
            saturation_ratio = 0.9

            [retry]
            max_attempts = 5

            [arbitration]
            min_participants = 5

            [scorer.weights]
            verification_success_rate = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.max_workers, 16);
        assert_eq!(config.backpressure.saturation_ratio, 0.9);
        // Untouched siblings keep their defaults.
        assert_eq!(config.backpressure.queue_depth, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.arbitration.min_participants, 5);
        assert_eq!(config.scorer.weights.verification_success_rate, 0.5);
        assert_eq!(config.scorer.weights.evidence_quality, 0.30);
    }

    #[test]
    fn resolve_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_workers = 2").unwrap();

        let config = Config::resolve(Some(file.path())).unwrap();
        assert_eq!(config.max_workers, 2);
    }

    #[test]
    fn resolve_missing_file_errors() {
        let result = Config::resolve(Some(Path::new("/nonexistent/drover.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn supervisor_slice_carries_sections() {
        let config = Config::from_toml_str("max_workers = 9").unwrap();
        let supervisor = config.supervisor();
        assert_eq!(supervisor.max_workers, 9);
        assert_eq!(supervisor.retry.max_attempts, 3);
    }
}
