//! Configuration for the federation control plane.

#![forbid(unsafe_code)]

use fed_proto::RoutingStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables for Health Monitor, Router, and backpressure behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Interval between health-check ticks, in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Per-probe deadline, in seconds.
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Consecutive failures before an instance is considered for
    /// auto-removal (advisory; auto-removal is actually driven by
    /// `auto_remove_after_ms`).
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// If set, the Registry unregisters an instance once
    /// `consecutiveFailures * checkInterval >= autoRemoveAfterMs`.
    #[serde(default)]
    pub auto_remove_after_ms: Option<u64>,

    /// Routing strategy used when a call doesn't specify one.
    #[serde(default = "default_routing_strategy")]
    pub default_routing_strategy: RoutingStrategy,

    /// Federation-wide utilization at or above which requests are rejected.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: f64,

    /// Federation-wide utilization at or above which requests are queued.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// TTL for session-affinity entries, in seconds.
    #[serde(default = "default_affinity_ttl_secs")]
    pub affinity_ttl_secs: u64,

    /// Bound on concurrent probes per tick. `0` means unbounded (probe
    /// every active instance at once).
    #[serde(default)]
    pub probe_concurrency: usize,
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_check_timeout_secs() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_routing_strategy() -> RoutingStrategy {
    RoutingStrategy::LeastLoaded
}

fn default_backpressure_threshold() -> f64 {
    0.95
}

fn default_warning_threshold() -> f64 {
    0.90
}

fn default_affinity_ttl_secs() -> u64 {
    3600
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            auto_remove_after_ms: None,
            default_routing_strategy: default_routing_strategy(),
            backpressure_threshold: default_backpressure_threshold(),
            warning_threshold: default_warning_threshold(),
            affinity_ttl_secs: default_affinity_ttl_secs(),
            probe_concurrency: 0,
        }
    }
}

impl FederationConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        let data = serde_json::to_string_pretty(self).expect("config is always serializable");
        std::fs::write(path, data).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let cfg = FederationConfig::default();
        assert_eq!(cfg.check_interval_secs, 30);
        assert_eq!(cfg.check_timeout_secs, 5);
        assert_eq!(cfg.unhealthy_threshold, 3);
        assert_eq!(cfg.auto_remove_after_ms, None);
        assert_eq!(cfg.default_routing_strategy, RoutingStrategy::LeastLoaded);
        assert_eq!(cfg.backpressure_threshold, 0.95);
        assert_eq!(cfg.warning_threshold, 0.90);
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = FederationConfig::default();
        cfg.auto_remove_after_ms = Some(600_000);
        cfg.save(&path).unwrap();

        let loaded = FederationConfig::load(&path).unwrap();
        assert_eq!(loaded.auto_remove_after_ms, Some(600_000));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(FederationConfig::load(&path).is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"check_interval_secs": 60}"#).unwrap();

        let loaded = FederationConfig::load(&path).unwrap();
        assert_eq!(loaded.check_interval_secs, 60);
        assert_eq!(loaded.check_timeout_secs, 5);
    }
}
