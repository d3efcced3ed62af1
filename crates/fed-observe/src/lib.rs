//! Observability for the federation control plane.
//!
//! Provides [`OperationsMetrics`] (atomic counters, Prometheus export via
//! [`MetricsExporter`]) and [`EventBus`], the fire-and-forget event sink
//! Registry, Router, and Health Monitor publish lifecycle events to.

#![forbid(unsafe_code)]

use fed_proto::FederationEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

// ─── Atomic counter ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─── Operations metrics ───────────────────────────────────────────────────────

/// Atomic counters for Registry, Router, and Health Monitor operations.
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    pub instances_registered_total: Counter,
    pub instances_unregistered_total: Counter,
    pub registration_errors_total: Counter,
    pub route_requests_total: Counter,
    pub route_errors_total: Counter,
    pub backpressure_rejections_total: Counter,
    pub health_checks_total: Counter,
    pub health_check_errors_total: Counter,
    pub health_transitions_total: Counter,
    pub capacity_reports_total: Counter,
    pub events_published_total: Counter,
}

impl OperationsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_instance_registered(&self) {
        self.instances_registered_total.inc();
        info!(
            counter = "instances_registered_total",
            value = self.instances_registered_total.get(),
            "instance registered"
        );
    }

    pub fn record_instance_unregistered(&self) {
        self.instances_unregistered_total.inc();
        info!(
            counter = "instances_unregistered_total",
            value = self.instances_unregistered_total.get(),
            "instance unregistered"
        );
    }

    pub fn record_registration_error(&self) {
        self.registration_errors_total.inc();
        warn!(
            counter = "registration_errors_total",
            value = self.registration_errors_total.get(),
            "instance registration failed"
        );
    }

    pub fn record_route_request(&self) {
        self.route_requests_total.inc();
    }

    pub fn record_route_error(&self) {
        self.route_errors_total.inc();
        warn!(
            counter = "route_errors_total",
            value = self.route_errors_total.get(),
            "routing request failed"
        );
    }

    pub fn record_backpressure_rejection(&self) {
        self.backpressure_rejections_total.inc();
        warn!(
            counter = "backpressure_rejections_total",
            value = self.backpressure_rejections_total.get(),
            "request rejected under backpressure"
        );
    }

    pub fn record_health_check(&self) {
        self.health_checks_total.inc();
    }

    pub fn record_health_check_error(&self) {
        self.health_check_errors_total.inc();
    }

    pub fn record_health_transition(&self) {
        self.health_transitions_total.inc();
        info!(
            counter = "health_transitions_total",
            value = self.health_transitions_total.get(),
            "instance health transitioned"
        );
    }

    pub fn record_capacity_report(&self) {
        self.capacity_reports_total.inc();
    }

    pub fn record_event_published(&self) {
        self.events_published_total.inc();
    }
}

// ─── Prometheus exporter ──────────────────────────────────────────────────────

pub struct MetricsExporter {
    metrics: Arc<OperationsMetrics>,
    prefix: String,
}

impl MetricsExporter {
    pub fn new(metrics: Arc<OperationsMetrics>) -> Self {
        Self::with_prefix(metrics, "federation")
    }

    pub fn with_prefix(metrics: Arc<OperationsMetrics>, prefix: impl Into<String>) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
        }
    }

    pub fn render(&self) -> String {
        let m = &self.metrics;
        let p = &self.prefix;
        let mut out = String::new();

        self.write_counter(&mut out, p, "instances_registered_total", "Total instances registered", m.instances_registered_total.get());
        self.write_counter(&mut out, p, "instances_unregistered_total", "Total instances unregistered", m.instances_unregistered_total.get());
        self.write_counter(&mut out, p, "registration_errors_total", "Total registration failures", m.registration_errors_total.get());
        self.write_counter(&mut out, p, "route_requests_total", "Total routing requests", m.route_requests_total.get());
        self.write_counter(&mut out, p, "route_errors_total", "Total routing failures", m.route_errors_total.get());
        self.write_counter(&mut out, p, "backpressure_rejections_total", "Total requests rejected under backpressure", m.backpressure_rejections_total.get());
        self.write_counter(&mut out, p, "health_checks_total", "Total health check probes completed", m.health_checks_total.get());
        self.write_counter(&mut out, p, "health_check_errors_total", "Total health check probe errors", m.health_check_errors_total.get());
        self.write_counter(&mut out, p, "health_transitions_total", "Total instance health status transitions", m.health_transitions_total.get());
        self.write_counter(&mut out, p, "capacity_reports_total", "Total capacity reports generated", m.capacity_reports_total.get());
        self.write_counter(&mut out, p, "events_published_total", "Total lifecycle events published", m.events_published_total.get());

        out
    }

    fn write_counter(&self, out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        out.push_str(&format!("{prefix}_{name} {value}\n\n"));
    }
}

// ─── Event bus ─────────────────────────────────────────────────────────────────

/// Default number of buffered events a lagging subscriber can fall behind by
/// before it starts missing events (per `tokio::sync::broadcast` semantics).
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fire-and-forget lifecycle event sink.
///
/// Delivery is best-effort: a subscriber that isn't receiving fast enough
/// falls behind and eventually misses events (`RecvError::Lagged`), but that
/// never blocks or slows down the publisher, and one slow subscriber can't
/// affect another.
pub struct EventBus {
    sender: broadcast::Sender<FederationEvent>,
    metrics: Option<Arc<OperationsMetrics>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<OperationsMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribe to future events. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers. A publish with zero
    /// subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, event: FederationEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event_published();
        }
        let _ = self.sender.send(event);
    }

    /// Number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
