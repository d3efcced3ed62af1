//! Protocol types for the agent-sandbox federation control plane.
//!
//! Defines the data model and value types shared between the Registry,
//! Router, and Health Monitor components, plus the error taxonomy callers
//! match on.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use uuid::Uuid;

/// Capacity of the bounded probe-result ring kept per instance.
pub const HEALTH_HISTORY_CAPACITY: usize = 100;

/// Opaque unique identifier for an instance, assigned on registration.
pub type InstanceId = Uuid;

// ─── Health status ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ─── Instance ─────────────────────────────────────────────────────────────────

/// An agent-execution sandbox host in the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub endpoint: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub version: Option<String>,
    pub capabilities: HashSet<String>,
    pub health_status: HealthStatus,
    pub current_sessions: u32,
    pub max_sessions: u32,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub routing_weight: f64,
    pub is_active: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// `currentSessions / maxSessions`, or `1.0` (fully loaded) when `maxSessions == 0`.
    pub fn utilization(&self) -> f64 {
        if self.max_sessions == 0 {
            1.0
        } else {
            self.current_sessions as f64 / self.max_sessions as f64
        }
    }

    /// Remaining session capacity (saturating at zero).
    pub fn remaining_capacity(&self) -> u32 {
        self.max_sessions.saturating_sub(self.current_sessions)
    }

    /// An instance is a routing candidate iff active and healthy-or-degraded.
    pub fn is_candidate(&self) -> bool {
        self.is_active && matches!(self.health_status, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Fields accepted when registering a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub endpoint: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    pub max_sessions: u32,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    #[serde(default = "default_routing_weight")]
    pub routing_weight: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_routing_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Fields a caller may merge into an existing instance via `update`.
///
/// `health_status` is intentionally here so the Health Monitor can write
/// back through the same path external bootstraps use — see §3 of
/// SPEC_FULL.md: "healthStatus is a function of the Health Monitor only
/// (external writers may bootstrap it to unknown)". The Registry does not
/// enforce that distinction; callers are trusted not to override it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub region: Option<String>,
    pub zone: Option<String>,
    pub version: Option<String>,
    pub capabilities: Option<HashSet<String>>,
    pub current_sessions: Option<u32>,
    pub max_sessions: Option<u32>,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub routing_weight: Option<f64>,
    pub is_active: Option<bool>,
    pub health_status: Option<HealthStatus>,
    pub last_health_check: Option<DateTime<Utc>>,
}

// ─── Routing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    LeastLoaded,
    RoundRobin,
    SessionAffinity,
    CapabilityMatch,
    Weighted,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LeastLoaded => "least-loaded",
            Self::RoundRobin => "round-robin",
            Self::SessionAffinity => "session-affinity",
            Self::CapabilityMatch => "capability-match",
            Self::Weighted => "weighted",
        };
        write!(f, "{s}")
    }
}

/// Per-call routing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingContext {
    pub tenant_id: Option<String>,
    pub session_affinity: Option<String>,
    pub required_capabilities: Option<HashSet<String>>,
    pub preferred_region: Option<String>,
    #[serde(default)]
    pub exclude_instances: HashSet<InstanceId>,
    pub strategy: Option<RoutingStrategy>,
    pub min_capacity: Option<u32>,
}

/// Result of a successful `selectInstance` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSelection {
    pub instance: Instance,
    pub reason: String,
    pub alternatives: Vec<Instance>,
    pub strategy: RoutingStrategy,
    pub decision_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    Ok,
    Queue,
    Reject,
    Scale,
}

/// Federation-wide backpressure evaluation for a single call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureStatus {
    pub should_reject: bool,
    pub current_utilization_pct: f64,
    pub threshold_pct: f64,
    pub message: String,
    pub recommended_action: RecommendedAction,
    pub estimated_wait_seconds: Option<u64>,
}

/// Per-region capacity breakdown, part of [`CapacityReport`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionCapacity {
    pub region: String,
    pub instance_count: u32,
    pub total_capacity: u32,
    pub current_sessions: u32,
    pub utilization: f64,
}

/// Derived, non-persisted fleet capacity summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityReport {
    pub total_instances: u32,
    pub healthy_instances: u32,
    pub total_capacity: u32,
    pub total_current_sessions: u32,
    pub utilization: f64,
    pub per_region: HashMap<String, RegionCapacity>,
}

// ─── Health checking ──────────────────────────────────────────────────────────

/// Result of a single probe of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub instance_id: InstanceId,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of probe results for one instance, plus the running
/// hysteresis counters the Health Monitor derives state transitions from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckHistory {
    pub results: VecDeque<HealthCheckResult>,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl HealthCheckHistory {
    /// Append a result, evicting the oldest entry once over capacity, and
    /// update the running counters per the hysteresis rule: `unhealthy`
    /// increments `consecutive_failures`, `healthy` resets it to zero,
    /// `degraded` leaves it unchanged.
    pub fn record(&mut self, result: HealthCheckResult) {
        match result.status {
            HealthStatus::Unhealthy => {
                self.consecutive_failures += 1;
                self.last_failure = Some(result.timestamp);
            }
            HealthStatus::Healthy => {
                self.consecutive_failures = 0;
                self.last_success = Some(result.timestamp);
            }
            HealthStatus::Degraded | HealthStatus::Unknown => {}
        }

        self.results.push_back(result);
        while self.results.len() > HEALTH_HISTORY_CAPACITY {
            self.results.pop_front();
        }
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// A transition payload shared by `health.degraded` / `.unhealthy` / `.recovered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTransition {
    pub instance_id: InstanceId,
    pub previous_status: HealthStatus,
    pub new_status: HealthStatus,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one completed health-check tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub checked: u32,
    pub healthy: u32,
    pub degraded: u32,
    pub unhealthy: u32,
    pub total_latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Every lifecycle event the control plane can emit (§6 of spec.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum FederationEvent {
    InstanceRegistered {
        instance: Instance,
        timestamp: DateTime<Utc>,
    },
    InstanceUnregistered {
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
    InstanceUpdated {
        instance: Instance,
        changes: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    InstanceHealthChanged {
        instance: Instance,
        previous_status: HealthStatus,
        new_status: HealthStatus,
        timestamp: DateTime<Utc>,
    },
    CapacityChanged {
        previous_capacity: CapacityReport,
        new_capacity: CapacityReport,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    BackpressureActivated {
        utilization: f64,
        threshold: f64,
        timestamp: DateTime<Utc>,
    },
    BackpressureRelieved {
        utilization: f64,
        threshold: f64,
        timestamp: DateTime<Utc>,
    },
    HealthChecked {
        instance_id: InstanceId,
        status: HealthStatus,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
    HealthDegraded(HealthTransition),
    HealthUnhealthy(HealthTransition),
    HealthRecovered(HealthTransition),
    CycleCompleted(CycleSummary),
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Error taxonomy for the federation control plane (§7 of spec.md).
///
/// Exhaustive for callers: Registry and Router surface exactly these
/// variants, never a bare string.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: InstanceId },

    #[error("failed to register instance: {message}")]
    InstanceRegistration {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("no available instance: {reason}")]
    NoAvailableInstance {
        reason: String,
        context: Box<RoutingContext>,
    },

    #[error("federation at capacity: utilization {utilization:.3} >= threshold {threshold:.3}")]
    FederationCapacity { utilization: f64, threshold: f64 },

    #[error("persistent store error: {0}")]
    Store(String),
}

pub type FederationResult<T> = Result<T, FederationError>;

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate that an endpoint looks like an absolute base URL.
pub fn validate_endpoint(endpoint: &str) -> bool {
    !endpoint.is_empty()
        && (endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        && endpoint.len() <= 2048
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_normal() {
        let i = make_instance(5, 10);
        assert_eq!(i.utilization(), 0.5);
    }

    #[test]
    fn test_utilization_zero_capacity_is_fully_loaded() {
        let i = make_instance(0, 0);
        assert_eq!(i.utilization(), 1.0);
    }

    #[test]
    fn test_is_candidate_requires_active_and_healthy_or_degraded() {
        let mut i = make_instance(0, 10);
        assert!(i.is_candidate());
        i.health_status = HealthStatus::Degraded;
        assert!(i.is_candidate());
        i.health_status = HealthStatus::Unhealthy;
        assert!(!i.is_candidate());
        i.health_status = HealthStatus::Healthy;
        i.is_active = false;
        assert!(!i.is_candidate());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("https://instance-1.internal:8080"));
        assert!(validate_endpoint("http://10.0.0.1"));
        assert!(!validate_endpoint(""));
        assert!(!validate_endpoint("instance-1.internal"));
    }

    #[test]
    fn test_routing_strategy_display() {
        assert_eq!(RoutingStrategy::LeastLoaded.to_string(), "least-loaded");
        assert_eq!(RoutingStrategy::CapabilityMatch.to_string(), "capability-match");
    }

    #[test]
    fn test_federation_event_serialization() {
        let event = FederationEvent::InstanceUnregistered {
            instance_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("instance_unregistered"));
    }

    #[test]
    fn test_health_history_hysteresis_counters() {
        let mut history = HealthCheckHistory::default();
        let probe = |status| HealthCheckResult {
            instance_id: Uuid::new_v4(),
            status,
            latency_ms: 10,
            error: None,
            details: None,
            timestamp: Utc::now(),
        };

        history.record(probe(HealthStatus::Unhealthy));
        assert_eq!(history.consecutive_failures, 1);

        history.record(probe(HealthStatus::Degraded));
        assert_eq!(history.consecutive_failures, 1);

        history.record(probe(HealthStatus::Healthy));
        assert_eq!(history.consecutive_failures, 0);
    }

    #[test]
    fn test_health_history_ring_is_bounded() {
        let mut history = HealthCheckHistory::default();
        for _ in 0..(HEALTH_HISTORY_CAPACITY + 10) {
            history.record(HealthCheckResult {
                instance_id: Uuid::new_v4(),
                status: HealthStatus::Healthy,
                latency_ms: 1,
                error: None,
                details: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(history.results.len(), HEALTH_HISTORY_CAPACITY);
    }

    fn make_instance(current: u32, max: u32) -> Instance {
        let now = Utc::now();
        Instance {
            id: Uuid::new_v4(),
            endpoint: "https://i.test".to_string(),
            region: None,
            zone: None,
            version: None,
            capabilities: HashSet::new(),
            health_status: HealthStatus::Healthy,
            current_sessions: current,
            max_sessions: max,
            cpu_percent: None,
            memory_percent: None,
            routing_weight: 1.0,
            is_active: true,
            last_health_check: None,
            created_at: now,
            updated_at: now,
        }
    }
}
