//! Periodic health-check loop for the federation control plane.
//!
//! The Health Monitor owns its own history rings and hysteresis counters; it
//! never reaches into Router state, and it writes back to the Registry only
//! through `Registry::update`.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use fed_config::FederationConfig;
use fed_observe::{EventBus, OperationsMetrics};
use fed_proto::{
    CycleSummary, FederationEvent, HealthCheckHistory, HealthCheckResult, HealthStatus,
    HealthTransition, Instance, InstanceId, InstanceUpdate,
};
use fed_registry::Registry;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

/// Result of a single probe attempt, before it's stamped with an instance id
/// and timestamp to become a [`HealthCheckResult`].
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Probe transport seam. [`ReqwestHealthProbe`] is the production
/// implementation; tests supply scripted fakes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeOutcome;
}

/// `GET {endpoint}/health` with `Accept: application/json` and a hard
/// deadline.
pub struct ReqwestHealthProbe {
    client: reqwest::Client,
}

impl ReqwestHealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for ReqwestHealthProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send();

        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if !response.status().is_success() {
                    return ProbeOutcome {
                        status: HealthStatus::Unhealthy,
                        latency_ms,
                        error: Some(format!("http {}", response.status())),
                        details: None,
                    };
                }
                match response.json::<serde_json::Value>().await {
                    Ok(body) => {
                        let status = classify(body.as_object());
                        ProbeOutcome {
                            status,
                            latency_ms,
                            error: None,
                            details: Some(body),
                        }
                    }
                    Err(_) => ProbeOutcome {
                        status: HealthStatus::Healthy,
                        latency_ms,
                        error: None,
                        details: None,
                    },
                }
            }
            Ok(Err(e)) => ProbeOutcome {
                status: HealthStatus::Unhealthy,
                latency_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
                details: None,
            },
            Err(_) => ProbeOutcome {
                status: HealthStatus::Unhealthy,
                latency_ms: timeout.as_millis() as u64,
                error: Some("probe deadline exceeded".to_string()),
                details: None,
            },
        }
    }
}

fn classify(obj: Option<&serde_json::Map<String, serde_json::Value>>) -> HealthStatus {
    let Some(obj) = obj else {
        return HealthStatus::Healthy;
    };

    let status = obj.get("status").and_then(|v| v.as_str());
    if status == Some("degraded") {
        return HealthStatus::Degraded;
    }
    if status == Some("unhealthy") {
        return HealthStatus::Unhealthy;
    }

    let cpu = obj.get("cpuPercent").and_then(|v| v.as_f64());
    let mem = obj.get("memoryPercent").and_then(|v| v.as_f64());
    if cpu.is_some_and(|c| c > 90.0) || mem.is_some_and(|m| m > 90.0) {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    metrics: Arc<OperationsMetrics>,
    config: FederationConfig,
    probe: Arc<dyn HealthProbe>,
    histories: RwLock<HashMap<InstanceId, HealthCheckHistory>>,
    running: AtomicBool,
    stop_notify: Notify,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<EventBus>,
        metrics: Arc<OperationsMetrics>,
        config: FederationConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            registry,
            events,
            metrics,
            config,
            probe,
            histories: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    /// Start the tick loop. Idempotent: a second call while already running
    /// logs a warning and does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("health monitor start() called while already running; ignoring");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop().await });
    }

    /// Stop the tick loop. Cancels the timer at the next await point; an
    /// in-flight probe cycle completes or times out naturally.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop_notify.notify_waiters();
        }
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.tick().await;
                }
                _ = self.stop_notify.notified() => break,
            }
        }
    }

    /// Probe every active instance concurrently and publish `cycle.completed`.
    pub async fn tick(&self) {
        let instances: Vec<Instance> = self
            .registry
            .get_all_instances()
            .into_iter()
            .filter(|i| i.is_active)
            .collect();

        let limit = if self.config.probe_concurrency == 0 {
            instances.len().max(1)
        } else {
            self.config.probe_concurrency
        };

        let results: Vec<HealthCheckResult> = stream::iter(instances)
            .map(|instance| async move { self.check_instance(&instance).await })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut healthy = 0u32;
        let mut degraded = 0u32;
        let mut unhealthy = 0u32;
        let mut total_latency_ms = 0u64;
        for result in &results {
            total_latency_ms += result.latency_ms;
            match result.status {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Degraded => degraded += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Unknown => {}
            }
        }

        self.events.publish(FederationEvent::CycleCompleted(CycleSummary {
            checked: results.len() as u32,
            healthy,
            degraded,
            unhealthy,
            total_latency_ms,
            timestamp: Utc::now(),
        }));
    }

    /// Probe a single instance on demand. Updates history, writes back to
    /// the Registry on a status transition, and emits exactly one event per
    /// transition.
    pub async fn check_instance(&self, instance: &Instance) -> HealthCheckResult {
        let timeout = Duration::from_secs(self.config.check_timeout_secs.max(1));
        let outcome = self.probe.probe(&instance.endpoint, timeout).await;
        let now = Utc::now();

        let result = HealthCheckResult {
            instance_id: instance.id,
            status: outcome.status,
            latency_ms: outcome.latency_ms,
            error: outcome.error,
            details: outcome.details,
            timestamp: now,
        };

        self.metrics.record_health_check();
        if result.error.is_some() {
            self.metrics.record_health_check_error();
        }

        let consecutive_failures = {
            let mut histories = self.histories.write();
            let history = histories.entry(instance.id).or_default();
            history.record(result.clone());
            history.consecutive_failures
        };

        self.events.publish(FederationEvent::HealthChecked {
            instance_id: instance.id,
            status: result.status,
            latency_ms: result.latency_ms,
            timestamp: now,
        });

        let previous = instance.health_status;
        if result.status != previous {
            let update = InstanceUpdate {
                health_status: Some(result.status),
                last_health_check: Some(now),
                ..Default::default()
            };

            match self.registry.update(instance.id, update).await {
                Ok(_) => self.announce_transition(instance.id, previous, result.status, consecutive_failures, now),
                Err(e) => warn!(
                    error = %e,
                    instance_id = %instance.id,
                    "failed to write back health status, continuing cycle"
                ),
            }
        }

        result
    }

    fn announce_transition(
        &self,
        instance_id: InstanceId,
        previous_status: HealthStatus,
        new_status: HealthStatus,
        consecutive_failures: u32,
        timestamp: chrono::DateTime<Utc>,
    ) {
        self.metrics.record_health_transition();
        let transition = HealthTransition {
            instance_id,
            previous_status,
            new_status,
            consecutive_failures,
            timestamp,
        };

        let event = match new_status {
            HealthStatus::Healthy => FederationEvent::HealthRecovered(transition),
            HealthStatus::Degraded => FederationEvent::HealthDegraded(transition),
            HealthStatus::Unhealthy => FederationEvent::HealthUnhealthy(transition),
            HealthStatus::Unknown => return,
        };
        self.events.publish(event);

        if new_status == HealthStatus::Unhealthy {
            self.maybe_auto_remove(instance_id, consecutive_failures);
        }
    }

    fn maybe_auto_remove(&self, instance_id: InstanceId, consecutive_failures: u32) {
        let Some(auto_remove_after_ms) = self.config.auto_remove_after_ms else {
            return;
        };
        let elapsed_ms = consecutive_failures as u64 * self.config.check_interval_secs * 1000;
        if elapsed_ms < auto_remove_after_ms {
            return;
        }

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if let Err(e) = registry.unregister(instance_id).await {
                warn!(error = %e, %instance_id, "failed to auto-remove sustained-unhealthy instance");
            }
        });
    }

    pub fn get_history(&self, id: InstanceId) -> Option<HealthCheckHistory> {
        self.histories.read().get(&id).cloned()
    }

    pub fn get_failure_count(&self, id: InstanceId) -> u32 {
        self.histories.read().get(&id).map(|h| h.consecutive_failures).unwrap_or(0)
    }

    pub fn clear_history(&self, id: InstanceId) {
        self.histories.write().remove(&id);
    }
}
