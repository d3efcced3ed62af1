//! Stateless-per-call instance selection for the federation control plane.
//!
//! The Router never mutates instance records; it reads a Registry snapshot
//! and owns only its own affinity table and backpressure/round-robin state.

#![forbid(unsafe_code)]

use fed_config::FederationConfig;
use fed_observe::EventBus;
use fed_proto::{
    BackpressureStatus, FederationError, FederationEvent, FederationResult, Instance, InstanceId,
    InstanceSelection, RecommendedAction, RoutingContext, RoutingStrategy,
};
use fed_registry::Registry;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Forward/reverse session-affinity maps kept in lockstep, per §4.2.1.
#[derive(Default)]
struct AffinityTable {
    forward: HashMap<String, InstanceId>,
    reverse: HashMap<InstanceId, HashSet<String>>,
    created_at: HashMap<String, Instant>,
}

impl AffinityTable {
    fn record(&mut self, session_id: String, instance_id: InstanceId) {
        if let Some(prior) = self.forward.get(&session_id) {
            if let Some(sessions) = self.reverse.get_mut(prior) {
                sessions.remove(&session_id);
            }
        }
        self.reverse.entry(instance_id).or_default().insert(session_id.clone());
        self.created_at.insert(session_id.clone(), Instant::now());
        self.forward.insert(session_id, instance_id);
    }

    fn clear_session(&mut self, session_id: &str) {
        if let Some(instance_id) = self.forward.remove(session_id) {
            if let Some(sessions) = self.reverse.get_mut(&instance_id) {
                sessions.remove(session_id);
            }
        }
        self.created_at.remove(session_id);
    }

    fn clear_instance(&mut self, instance_id: InstanceId) {
        if let Some(sessions) = self.reverse.remove(&instance_id) {
            for session_id in sessions {
                self.forward.remove(&session_id);
                self.created_at.remove(&session_id);
            }
        }
    }

    fn lookup(&self, session_id: &str) -> Option<InstanceId> {
        self.forward.get(session_id).copied()
    }

    fn sweep_expired(&mut self, ttl: std::time::Duration) {
        let expired: Vec<String> = self
            .created_at
            .iter()
            .filter(|(_, created)| created.elapsed() >= ttl)
            .map(|(session, _)| session.clone())
            .collect();
        for session_id in expired {
            self.clear_session(&session_id);
        }
    }
}

pub struct Router {
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    config: FederationConfig,
    affinity: RwLock<AffinityTable>,
    round_robin_counter: AtomicU64,
    backpressure_active: AtomicBool,
}

impl Router {
    pub fn new(registry: Arc<Registry>, events: Arc<EventBus>, config: FederationConfig) -> Self {
        Self {
            registry,
            events,
            config,
            affinity: RwLock::new(AffinityTable::default()),
            round_robin_counter: AtomicU64::new(0),
            backpressure_active: AtomicBool::new(false),
        }
    }

    /// Select an instance for `ctx`. Pure function of the Registry snapshot
    /// observed at the start of the call plus the Router's own affinity and
    /// round-robin state.
    pub fn select_instance(&self, ctx: RoutingContext) -> FederationResult<InstanceSelection> {
        let start = Instant::now();

        let backpressure = self.evaluate_backpressure();
        if backpressure.should_reject {
            return Err(FederationError::FederationCapacity {
                utilization: backpressure.current_utilization_pct,
                threshold: backpressure.threshold_pct,
            });
        }

        let snapshot = self.registry.get_healthy_instances();
        let candidates = self.filter_candidates(&snapshot, &ctx);
        if candidates.is_empty() {
            return Err(FederationError::NoAvailableInstance {
                reason: "no candidate satisfied the routing context".to_string(),
                context: Box::new(ctx),
            });
        }

        let strategy = ctx.strategy.unwrap_or(self.config.default_routing_strategy);
        let (chosen, reason) = self.pick(strategy, &ctx, &candidates);

        if let Some(session_id) = ctx.session_affinity.clone() {
            self.affinity.write().record(session_id, chosen.id);
        }

        let alternatives = candidates
            .iter()
            .filter(|i| i.id != chosen.id)
            .take(3)
            .cloned()
            .collect();

        Ok(InstanceSelection {
            instance: chosen,
            reason,
            alternatives,
            strategy,
            decision_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn filter_candidates(&self, snapshot: &[Instance], ctx: &RoutingContext) -> Vec<Instance> {
        let mut candidates: Vec<Instance> = snapshot
            .iter()
            .filter(|i| {
                ctx.required_capabilities
                    .as_ref()
                    .is_none_or(|required| required.is_subset(&i.capabilities))
            })
            .cloned()
            .collect();

        if let Some(region) = &ctx.preferred_region {
            let in_region: Vec<Instance> = candidates
                .iter()
                .filter(|i| i.region.as_deref() == Some(region.as_str()))
                .cloned()
                .collect();
            if !in_region.is_empty() {
                candidates = in_region;
            }
        }

        candidates.retain(|i| !ctx.exclude_instances.contains(&i.id));

        if let Some(min_capacity) = ctx.min_capacity {
            candidates.retain(|i| i.remaining_capacity() >= min_capacity);
        }

        candidates
    }

    fn pick(&self, strategy: RoutingStrategy, ctx: &RoutingContext, candidates: &[Instance]) -> (Instance, String) {
        match strategy {
            RoutingStrategy::LeastLoaded => self.pick_least_loaded(candidates),
            RoutingStrategy::RoundRobin => self.pick_round_robin(candidates),
            RoutingStrategy::SessionAffinity => self.pick_session_affinity(ctx, candidates),
            RoutingStrategy::CapabilityMatch => self.pick_capability_match(ctx, candidates),
            RoutingStrategy::Weighted => self.pick_weighted(candidates),
        }
    }

    fn pick_least_loaded(&self, candidates: &[Instance]) -> (Instance, String) {
        let mut best = &candidates[0];
        let mut best_utilization = best.utilization();
        for candidate in &candidates[1..] {
            let utilization = candidate.utilization();
            if utilization < best_utilization {
                best = candidate;
                best_utilization = utilization;
            }
        }
        (best.clone(), "lowest load among candidates".to_string())
    }

    fn pick_round_robin(&self, candidates: &[Instance]) -> (Instance, String) {
        let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        (candidates[index].clone(), "round-robin rotation".to_string())
    }

    fn pick_session_affinity(&self, ctx: &RoutingContext, candidates: &[Instance]) -> (Instance, String) {
        if let Some(session_id) = &ctx.session_affinity {
            let existing = self.affinity.read().lookup(session_id);
            if let Some(instance_id) = existing {
                if let Some(instance) = candidates.iter().find(|i| i.id == instance_id) {
                    return (instance.clone(), "sticky session affinity".to_string());
                }
                self.affinity.write().clear_session(session_id);
            }
        }
        self.pick_least_loaded(candidates)
    }

    fn pick_capability_match(&self, ctx: &RoutingContext, candidates: &[Instance]) -> (Instance, String) {
        let Some(required) = ctx.required_capabilities.as_ref().filter(|r| !r.is_empty()) else {
            return self.pick_least_loaded(candidates);
        };

        let mut best = &candidates[0];
        let mut best_score = capability_score(best, required);
        for candidate in &candidates[1..] {
            let score = capability_score(candidate, required);
            if score > best_score {
                best = candidate;
                best_score = score;
            }
        }
        (best.clone(), "best capability match".to_string())
    }

    fn pick_weighted(&self, candidates: &[Instance]) -> (Instance, String) {
        let total_weight: f64 = candidates.iter().map(|i| i.routing_weight.max(0.0)).sum();
        if total_weight <= 0.0 {
            return (candidates[0].clone(), "weighted sampling (zero total weight)".to_string());
        }
        let mut remaining = rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..total_weight);
        for candidate in candidates {
            remaining -= candidate.routing_weight.max(0.0);
            if remaining <= 0.0 {
                return (candidate.clone(), "weighted random sample".to_string());
            }
        }
        (candidates[candidates.len() - 1].clone(), "weighted sampling (drift fallback)".to_string())
    }

    /// Derive backpressure status from the Registry's current capacity
    /// report, publishing `backpressure.activated`/`.relieved` exactly on
    /// transition.
    pub fn evaluate_backpressure(&self) -> BackpressureStatus {
        let report = self.registry.get_capacity_report();
        let utilization = report.utilization;
        let reject = self.config.backpressure_threshold;
        let warn = self.config.warning_threshold;

        let (should_reject, recommended_action, estimated_wait_seconds) = if utilization >= reject {
            (true, RecommendedAction::Scale, None)
        } else if utilization >= warn {
            let span = (reject - warn).max(f64::EPSILON);
            let offset = (utilization - warn) / span;
            let wait = if offset < 1.0 / 3.0 {
                0
            } else if offset < 2.0 / 3.0 {
                30
            } else {
                60
            };
            (false, RecommendedAction::Queue, Some(wait))
        } else {
            (false, RecommendedAction::Ok, None)
        };

        let was_active = self.backpressure_active.swap(should_reject, Ordering::Relaxed);
        if should_reject && !was_active {
            info!(utilization, reject, "backpressure activated");
            self.events.publish(FederationEvent::BackpressureActivated {
                utilization,
                threshold: reject,
                timestamp: chrono::Utc::now(),
            });
        } else if !should_reject && was_active {
            info!(utilization, reject, "backpressure relieved");
            self.events.publish(FederationEvent::BackpressureRelieved {
                utilization,
                threshold: reject,
                timestamp: chrono::Utc::now(),
            });
        }

        let message = match recommended_action {
            RecommendedAction::Scale => format!("utilization {:.1}% at or above reject threshold {:.1}%", utilization * 100.0, reject * 100.0),
            RecommendedAction::Queue => format!("utilization {:.1}% at or above warning threshold {:.1}%", utilization * 100.0, warn * 100.0),
            RecommendedAction::Ok | RecommendedAction::Reject => "utilization within normal range".to_string(),
        };

        BackpressureStatus {
            should_reject,
            current_utilization_pct: utilization,
            threshold_pct: reject,
            message,
            recommended_action,
            estimated_wait_seconds,
        }
    }

    pub fn clear_affinity(&self, session_id: &str) {
        self.affinity.write().clear_session(session_id);
    }

    pub fn clear_instance_affinities(&self, instance_id: InstanceId) {
        self.affinity.write().clear_instance(instance_id);
    }

    /// Drop affinity entries older than the configured TTL. Callers should
    /// not invoke this more often than the TTL itself.
    pub fn sweep_expired_affinities(&self) {
        let ttl = std::time::Duration::from_secs(self.config.affinity_ttl_secs);
        self.affinity.write().sweep_expired(ttl);
    }

    /// Listen for `instance.unregistered` events and clear that instance's
    /// affinity entries. The Registry never calls back into the Router
    /// directly; this is the subscription side of that design.
    pub async fn run_affinity_event_listener(self: Arc<Self>, mut events: tokio::sync::broadcast::Receiver<FederationEvent>) {
        loop {
            match events.recv().await {
                Ok(FederationEvent::InstanceUnregistered { instance_id, .. }) => {
                    self.clear_instance_affinities(instance_id);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn capability_score(instance: &Instance, required: &HashSet<String>) -> f64 {
    let matched = required.intersection(&instance.capabilities).count();
    let match_ratio = matched as f64 / required.len() as f64;
    match_ratio * 1000.0 - instance.utilization()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fed_proto::{HealthStatus, InstanceRegistration};
    use fed_store::InMemoryInstanceStore;

    async fn router_with(instances: Vec<InstanceRegistration>) -> (Arc<Router>, Vec<Instance>) {
        let store: Arc<dyn fed_store::InstanceStore> = Arc::new(InMemoryInstanceStore::new());
        let events = Arc::new(EventBus::new(64));
        let metrics = Arc::new(fed_observe::OperationsMetrics::new());
        let registry = Arc::new(Registry::new(store, events.clone(), metrics).await.unwrap());

        let mut created = Vec::new();
        for reg in instances {
            let instance = registry.register(reg).await.unwrap();
            let instance = registry
                .update(
                    instance.id,
                    fed_proto::InstanceUpdate {
                        health_status: Some(HealthStatus::Healthy),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            created.push(instance);
        }

        let router = Arc::new(Router::new(registry, events, FederationConfig::default()));
        (router, created)
    }

    fn registration(endpoint: &str, region: &str, max: u32) -> InstanceRegistration {
        InstanceRegistration {
            endpoint: endpoint.to_string(),
            region: Some(region.to_string()),
            zone: None,
            version: None,
            capabilities: HashSet::new(),
            max_sessions: max,
            cpu_percent: None,
            memory_percent: None,
            routing_weight: 1.0,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn scenario_1_least_loaded_picks_least_utilized() {
        let (router, instances) = router_with(vec![
            registration("https://a.test", "us-east-1", 10),
            registration("https://b.test", "us-east-1", 10),
        ])
        .await;

        router
            .registry
            .update(instances[0].id, fed_proto::InstanceUpdate { current_sessions: Some(1), ..Default::default() })
            .await
            .unwrap();
        router
            .registry
            .update(instances[1].id, fed_proto::InstanceUpdate { current_sessions: Some(5), ..Default::default() })
            .await
            .unwrap();

        let ctx = RoutingContext {
            strategy: Some(RoutingStrategy::LeastLoaded),
            ..Default::default()
        };
        let selection = router.select_instance(ctx).unwrap();
        assert_eq!(selection.instance.id, instances[0].id);
        assert!(selection.reason.contains("lowest load"));
    }

    #[tokio::test]
    async fn scenario_2_region_is_a_soft_preference() {
        let (router, instances) = router_with(vec![
            registration("https://a.test", "us-east-1", 10),
            registration("https://b.test", "eu-west-1", 10),
        ])
        .await;

        let ctx = RoutingContext {
            preferred_region: Some("us-east-1".to_string()),
            strategy: Some(RoutingStrategy::LeastLoaded),
            ..Default::default()
        };
        let selection = router.select_instance(ctx).unwrap();
        assert_eq!(selection.instance.id, instances[0].id);

        let ctx = RoutingContext {
            preferred_region: Some("ap-south-1".to_string()),
            strategy: Some(RoutingStrategy::LeastLoaded),
            ..Default::default()
        };
        let selection = router.select_instance(ctx).unwrap();
        assert_eq!(selection.instance.id, instances[1].id);
    }

    #[tokio::test]
    async fn scenario_3_affinity_survives_and_reroutes_on_removal() {
        let (router, instances) = router_with(vec![
            registration("https://a.test", "us-east-1", 10),
            registration("https://b.test", "us-east-1", 10),
        ])
        .await;

        let ctx = RoutingContext {
            session_affinity: Some("s1".to_string()),
            strategy: Some(RoutingStrategy::SessionAffinity),
            ..Default::default()
        };
        let first = router.select_instance(ctx.clone()).unwrap();
        let second = router.select_instance(ctx.clone()).unwrap();
        assert_eq!(first.instance.id, second.instance.id);

        let deactivated_id = first.instance.id;
        router
            .registry
            .update(deactivated_id, fed_proto::InstanceUpdate { is_active: Some(false), ..Default::default() })
            .await
            .unwrap();

        let third = router.select_instance(ctx).unwrap();
        assert_ne!(third.instance.id, deactivated_id);
        assert_eq!(router.affinity.read().lookup("s1"), Some(third.instance.id));

        let _ = instances;
    }

    #[tokio::test]
    async fn scenario_4_capability_filter_is_strict() {
        let (router, _instances) = {
            let store: Arc<dyn fed_store::InstanceStore> = Arc::new(InMemoryInstanceStore::new());
            let events = Arc::new(EventBus::new(64));
            let metrics = Arc::new(fed_observe::OperationsMetrics::new());
            let registry = Arc::new(Registry::new(store, events.clone(), metrics).await.unwrap());

            let a = registry
                .register(InstanceRegistration {
                    endpoint: "https://a.test".to_string(),
                    region: None,
                    zone: None,
                    version: None,
                    capabilities: HashSet::from(["gpu".to_string()]),
                    max_sessions: 10,
                    cpu_percent: None,
                    memory_percent: None,
                    routing_weight: 1.0,
                    is_active: true,
                })
                .await
                .unwrap();
            let b = registry
                .register(InstanceRegistration {
                    endpoint: "https://b.test".to_string(),
                    region: None,
                    zone: None,
                    version: None,
                    capabilities: HashSet::from(["gpu".to_string(), "vision".to_string()]),
                    max_sessions: 10,
                    cpu_percent: None,
                    memory_percent: None,
                    routing_weight: 1.0,
                    is_active: true,
                })
                .await
                .unwrap();

            for instance in [&a, &b] {
                registry
                    .update(instance.id, fed_proto::InstanceUpdate { health_status: Some(HealthStatus::Healthy), ..Default::default() })
                    .await
                    .unwrap();
            }

            let router = Router::new(registry, events, FederationConfig::default());
            (Arc::new(router), vec![a, b])
        };

        let b = &_instances[1];

        let ctx = RoutingContext {
            required_capabilities: Some(HashSet::from(["gpu".to_string(), "vision".to_string()])),
            ..Default::default()
        };
        let selection = router.select_instance(ctx).unwrap();
        assert_eq!(selection.instance.id, b.id);

        let ctx = RoutingContext {
            required_capabilities: Some(HashSet::from(["tpu".to_string()])),
            ..Default::default()
        };
        let result = router.select_instance(ctx);
        assert!(matches!(result, Err(FederationError::NoAvailableInstance { .. })));
    }

    #[tokio::test]
    async fn scenario_5_backpressure_at_97_percent() {
        let (router, instances) = router_with(vec![
            registration("https://a.test", "us-east-1", 50),
            registration("https://b.test", "us-east-1", 50),
        ])
        .await;

        for instance in &instances {
            router
                .registry
                .update(instance.id, fed_proto::InstanceUpdate { current_sessions: Some(49), ..Default::default() })
                .await
                .unwrap();
        }

        let result = router.select_instance(RoutingContext::default());
        match result {
            Err(FederationError::FederationCapacity { utilization, threshold }) => {
                assert!((utilization - 0.98).abs() < 0.01);
                assert!((threshold - 0.95).abs() < 1e-9);
            }
            other => panic!("expected FederationCapacity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_candidates_after_filtering_errors() {
        let (router, _instances) = router_with(vec![registration("https://a.test", "us-east-1", 10)]).await;
        let ctx = RoutingContext {
            exclude_instances: HashSet::from([_instances[0].id]),
            ..Default::default()
        };
        assert!(matches!(router.select_instance(ctx), Err(FederationError::NoAvailableInstance { .. })));
    }

    #[tokio::test]
    async fn test_max_sessions_zero_never_wins_least_loaded() {
        let (router, instances) = router_with(vec![
            registration("https://a.test", "us-east-1", 0),
            registration("https://b.test", "us-east-1", 10),
        ])
        .await;

        let selection = router.select_instance(RoutingContext::default()).unwrap();
        assert_eq!(selection.instance.id, instances[1].id);
    }

    #[test]
    fn test_clear_affinity_is_idempotent() {
        let mut table = AffinityTable::default();
        let id = uuid::Uuid::new_v4();
        table.record("s1".to_string(), id);
        table.clear_session("s1");
        table.clear_session("s1");
        assert!(table.lookup("s1").is_none());
    }

    #[test]
    fn test_affinity_bijective() {
        let mut table = AffinityTable::default();
        let id = uuid::Uuid::new_v4();
        table.record("s1".to_string(), id);
        assert_eq!(table.forward.get("s1"), Some(&id));
        assert!(table.reverse.get(&id).unwrap().contains("s1"));
    }
}
