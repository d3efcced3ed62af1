//! Authoritative instance index for the federation control plane.
//!
//! The Registry is the single writer for instance records. Router and
//! Health Monitor only ever read it through its public operations; it
//! never reaches into their state.

#![forbid(unsafe_code)]

use chrono::Utc;
use fed_observe::{EventBus, OperationsMetrics};
use fed_proto::{
    CapacityReport, FederationError, FederationResult, HealthStatus, Instance,
    InstanceId, InstanceRegistration, InstanceUpdate, RegionCapacity, validate_endpoint,
};
use fed_store::InstanceStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Registry {
    store: Arc<dyn InstanceStore>,
    events: Arc<EventBus>,
    metrics: Arc<OperationsMetrics>,
    index: RwLock<HashMap<InstanceId, Instance>>,
}

impl Registry {
    /// Build a Registry, loading all existing records from `store` to
    /// rebuild the in-memory index.
    pub async fn new(
        store: Arc<dyn InstanceStore>,
        events: Arc<EventBus>,
        metrics: Arc<OperationsMetrics>,
    ) -> FederationResult<Self> {
        let records = store.list().await?;
        let index = records.into_iter().map(|i| (i.id, i)).collect();
        info!(count = ?index_len(&index), "registry loaded instances from store");
        Ok(Self {
            store,
            events,
            metrics,
            index: RwLock::new(index),
        })
    }

    /// Validate endpoint uniqueness, persist, index, and announce the new
    /// instance. Index is updated only after the store write succeeds.
    pub async fn register(&self, input: InstanceRegistration) -> FederationResult<Instance> {
        if !validate_endpoint(&input.endpoint) {
            self.metrics.record_registration_error();
            return Err(FederationError::InstanceRegistration {
                message: format!("invalid endpoint: {}", input.endpoint),
                cause: None,
            });
        }

        if self.index.read().values().any(|i| i.endpoint == input.endpoint) {
            self.metrics.record_registration_error();
            return Err(FederationError::InstanceRegistration {
                message: format!("endpoint already registered: {}", input.endpoint),
                cause: None,
            });
        }

        let now = Utc::now();
        let instance = Instance {
            id: uuid::Uuid::new_v4(),
            endpoint: input.endpoint,
            region: input.region,
            zone: input.zone,
            version: input.version,
            capabilities: input.capabilities,
            health_status: HealthStatus::Unknown,
            current_sessions: 0,
            max_sessions: input.max_sessions,
            cpu_percent: input.cpu_percent,
            memory_percent: input.memory_percent,
            routing_weight: input.routing_weight,
            is_active: input.is_active,
            last_health_check: None,
            created_at: now,
            updated_at: now,
        };

        self.store.save(instance.clone()).await.map_err(|e| {
            self.metrics.record_registration_error();
            FederationError::InstanceRegistration {
                message: "store write failed".to_string(),
                cause: Some(Box::new(e)),
            }
        })?;

        self.index.write().insert(instance.id, instance.clone());
        self.metrics.record_instance_registered();
        self.events.publish(fed_proto::FederationEvent::InstanceRegistered {
            instance: instance.clone(),
            timestamp: now,
        });

        Ok(instance)
    }

    /// Remove an instance from the index and store. Returns `false` if it
    /// wasn't present.
    pub async fn unregister(&self, id: InstanceId) -> FederationResult<bool> {
        if self.index.read().get(&id).is_none() {
            return Ok(false);
        }

        self.store.delete(id).await.map_err(log_store_err)?;
        self.index.write().remove(&id);
        self.metrics.record_instance_unregistered();
        self.events.publish(fed_proto::FederationEvent::InstanceUnregistered {
            instance_id: id,
            timestamp: Utc::now(),
        });

        Ok(true)
    }

    /// Merge permitted fields into an existing instance, persist, and
    /// announce the change. Also announces a health transition when
    /// `healthStatus` changed.
    pub async fn update(&self, id: InstanceId, partial: InstanceUpdate) -> FederationResult<Instance> {
        let previous = self
            .index
            .read()
            .get(&id)
            .cloned()
            .ok_or(FederationError::InstanceNotFound { instance_id: id })?;

        let mut next = previous.clone();
        let mut changes = Vec::new();

        if let Some(v) = partial.region {
            if previous.region != Some(v.clone()) {
                changes.push("region".to_string());
            }
            next.region = Some(v);
        }
        if let Some(v) = partial.zone {
            if previous.zone != Some(v.clone()) {
                changes.push("zone".to_string());
            }
            next.zone = Some(v);
        }
        if let Some(v) = partial.version {
            if previous.version != Some(v.clone()) {
                changes.push("version".to_string());
            }
            next.version = Some(v);
        }
        if let Some(v) = partial.capabilities {
            if previous.capabilities != v {
                changes.push("capabilities".to_string());
            }
            next.capabilities = v;
        }
        if let Some(v) = partial.cpu_percent {
            if previous.cpu_percent != Some(v) {
                changes.push("cpu_percent".to_string());
            }
            next.cpu_percent = Some(v);
        }
        if let Some(v) = partial.memory_percent {
            if previous.memory_percent != Some(v) {
                changes.push("memory_percent".to_string());
            }
            next.memory_percent = Some(v);
        }
        if let Some(v) = partial.last_health_check {
            next.last_health_check = Some(v);
        }

        if let Some(v) = partial.current_sessions {
            if v != previous.current_sessions {
                changes.push("current_sessions".to_string());
            }
            next.current_sessions = v;
        }
        if let Some(v) = partial.max_sessions {
            if v != previous.max_sessions {
                changes.push("max_sessions".to_string());
            }
            next.max_sessions = v;
        }
        if let Some(v) = partial.routing_weight {
            if v != previous.routing_weight {
                changes.push("routing_weight".to_string());
            }
            next.routing_weight = v;
        }
        if let Some(v) = partial.is_active {
            if v != previous.is_active {
                changes.push("is_active".to_string());
            }
            next.is_active = v;
        }
        if let Some(v) = partial.health_status {
            if v != previous.health_status {
                changes.push("health_status".to_string());
            }
            next.health_status = v;
        }

        next.updated_at = Utc::now();

        self.store
            .save(next.clone())
            .await
            .map_err(log_store_err)?;
        self.index.write().insert(id, next.clone());

        self.events.publish(fed_proto::FederationEvent::InstanceUpdated {
            instance: next.clone(),
            changes: changes.clone(),
            timestamp: next.updated_at,
        });

        if next.health_status != previous.health_status {
            self.metrics.record_health_transition();
            self.events.publish(fed_proto::FederationEvent::InstanceHealthChanged {
                instance: next.clone(),
                previous_status: previous.health_status,
                new_status: next.health_status,
                timestamp: next.updated_at,
            });
        }

        Ok(next)
    }

    pub fn get(&self, id: InstanceId) -> Option<Instance> {
        self.index.read().get(&id).cloned()
    }

    pub fn get_by_endpoint(&self, endpoint: &str) -> Option<Instance> {
        self.index.read().values().find(|i| i.endpoint == endpoint).cloned()
    }

    pub fn get_all_instances(&self) -> Vec<Instance> {
        self.index.read().values().cloned().collect()
    }

    /// Active instances whose health status is `healthy` or `degraded`.
    pub fn get_healthy_instances(&self) -> Vec<Instance> {
        self.index
            .read()
            .values()
            .filter(|i| i.is_candidate())
            .cloned()
            .collect()
    }

    pub fn get_capacity_report(&self) -> CapacityReport {
        let index = self.index.read();
        let active: Vec<&Instance> = index.values().filter(|i| i.is_active).collect();

        let total_instances = index.len() as u32;
        let healthy_instances = index.values().filter(|i| i.is_candidate()).count() as u32;
        let total_capacity: u32 = active.iter().map(|i| i.max_sessions).sum();
        let total_current_sessions: u32 = active.iter().map(|i| i.current_sessions).sum();
        let utilization = if total_capacity == 0 {
            if total_current_sessions == 0 { 0.0 } else { 1.0 }
        } else {
            total_current_sessions as f64 / total_capacity as f64
        };

        let mut per_region: HashMap<String, RegionCapacity> = HashMap::new();
        for instance in &active {
            let Some(region) = &instance.region else { continue };
            let entry = per_region.entry(region.clone()).or_insert_with(|| RegionCapacity {
                region: region.clone(),
                instance_count: 0,
                total_capacity: 0,
                current_sessions: 0,
                utilization: 0.0,
            });
            entry.instance_count += 1;
            entry.total_capacity += instance.max_sessions;
            entry.current_sessions += instance.current_sessions;
        }
        for entry in per_region.values_mut() {
            entry.utilization = if entry.total_capacity == 0 {
                0.0
            } else {
                entry.current_sessions as f64 / entry.total_capacity as f64
            };
        }

        self.metrics.record_capacity_report();

        CapacityReport {
            total_instances,
            healthy_instances,
            total_capacity,
            total_current_sessions,
            utilization,
            per_region,
        }
    }
}

fn index_len(map: &HashMap<InstanceId, Instance>) -> usize {
    map.len()
}

fn log_store_err(e: FederationError) -> FederationError {
    warn!(error = %e, "registry store operation failed");
    e
}
