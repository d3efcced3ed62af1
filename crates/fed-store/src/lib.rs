//! Instance persistence for the federation control plane.
//!
//! [`InstanceStore`] is the storage seam the Registry is built against; the
//! Registry never touches a file or lock directly. [`JsonInstanceStore`]
//! snapshots to disk on every write; [`InMemoryInstanceStore`] is the
//! zero-dependency implementation used in
//! tests and by default when no state path is configured.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use fed_persist::JsonStore;
use fed_proto::{FederationResult, Instance, InstanceId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Storage seam for [`Instance`] records.
///
/// Implementations are expected to be internally synchronized; the trait is
/// `async` so a future network-backed store (etcd, Postgres) can implement
/// it without changing callers.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or overwrite an instance by id.
    async fn save(&self, instance: Instance) -> FederationResult<()>;

    async fn find_by_id(&self, id: InstanceId) -> FederationResult<Option<Instance>>;

    async fn find_by_endpoint(&self, endpoint: &str) -> FederationResult<Option<Instance>>;

    async fn list(&self) -> FederationResult<Vec<Instance>>;

    async fn delete(&self, id: InstanceId) -> FederationResult<()>;

    async fn find_by_region(&self, region: &str) -> FederationResult<Vec<Instance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.region.as_deref() == Some(region))
            .collect())
    }

    async fn find_by_capability(&self, capability: &str) -> FederationResult<Vec<Instance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.capabilities.contains(capability))
            .collect())
    }

    async fn get_healthy(&self) -> FederationResult<Vec<Instance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.is_candidate())
            .collect())
    }
}

/// In-memory [`InstanceStore`]. No persistence across process restarts.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save(&self, instance: Instance) -> FederationResult<()> {
        self.instances.write().insert(instance.id, instance);
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> FederationResult<Option<Instance>> {
        Ok(self.instances.read().get(&id).cloned())
    }

    async fn find_by_endpoint(&self, endpoint: &str) -> FederationResult<Option<Instance>> {
        Ok(self
            .instances
            .read()
            .values()
            .find(|i| i.endpoint == endpoint)
            .cloned())
    }

    async fn list(&self) -> FederationResult<Vec<Instance>> {
        Ok(self.instances.read().values().cloned().collect())
    }

    async fn delete(&self, id: InstanceId) -> FederationResult<()> {
        self.instances.write().remove(&id);
        Ok(())
    }
}

/// JSON file-backed [`InstanceStore`], built on [`fed_persist::JsonStore`].
///
/// Keeps a full in-memory copy and rewrites the whole file on every write:
/// simple and correct at fleet scale, not meant for high write-rate
/// workloads.
pub struct JsonInstanceStore {
    instances: RwLock<HashMap<String, Instance>>,
    store: JsonStore,
}

impl JsonInstanceStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "instances");
        let instances = store.load();
        Self {
            instances: RwLock::new(instances),
            store,
        }
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.instances.read()) {
            warn!(error = %e, "failed to persist instance store snapshot");
        }
    }
}

#[async_trait]
impl InstanceStore for JsonInstanceStore {
    async fn save(&self, instance: Instance) -> FederationResult<()> {
        self.instances
            .write()
            .insert(instance.id.to_string(), instance);
        self.snapshot();
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> FederationResult<Option<Instance>> {
        Ok(self.instances.read().get(&id.to_string()).cloned())
    }

    async fn find_by_endpoint(&self, endpoint: &str) -> FederationResult<Option<Instance>> {
        Ok(self
            .instances
            .read()
            .values()
            .find(|i| i.endpoint == endpoint)
            .cloned())
    }

    async fn list(&self) -> FederationResult<Vec<Instance>> {
        Ok(self.instances.read().values().cloned().collect())
    }

    async fn delete(&self, id: InstanceId) -> FederationResult<()> {
        let removed = self.instances.write().remove(&id.to_string()).is_some();
        if removed {
            self.snapshot();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_instance(endpoint: &str) -> Instance {
        let now = chrono::Utc::now();
        Instance {
            id: uuid::Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            region: Some("us-east".to_string()),
            zone: None,
            version: None,
            capabilities: HashSet::from(["python".to_string()]),
            health_status: fed_proto::HealthStatus::Healthy,
            current_sessions: 0,
            max_sessions: 10,
            cpu_percent: None,
            memory_percent: None,
            routing_weight: 1.0,
            is_active: true,
            last_health_check: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_in_memory_save_and_find() {
        let store = InMemoryInstanceStore::new();
        let instance = make_instance("https://a.test");
        let id = instance.id;
        store.save(instance).await.unwrap();

        assert!(store.find_by_id(id).await.unwrap().is_some());
        assert!(store.find_by_endpoint("https://a.test").await.unwrap().is_some());
        assert!(store.find_by_endpoint("https://missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_find_by_region_and_capability() {
        let store = InMemoryInstanceStore::new();
        store.save(make_instance("https://a.test")).await.unwrap();
        store.save(make_instance("https://b.test")).await.unwrap();

        assert_eq!(store.find_by_region("us-east").await.unwrap().len(), 2);
        assert_eq!(store.find_by_region("eu-west").await.unwrap().len(), 0);
        assert_eq!(store.find_by_capability("python").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_get_healthy_excludes_inactive() {
        let store = InMemoryInstanceStore::new();
        let mut inactive = make_instance("https://a.test");
        inactive.is_active = false;
        store.save(inactive).await.unwrap();
        store.save(make_instance("https://b.test")).await.unwrap();

        assert_eq!(store.get_healthy().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_delete() {
        let store = InMemoryInstanceStore::new();
        let instance = make_instance("https://a.test");
        let id = instance.id;
        store.save(instance).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.find_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let instance = make_instance("https://a.test");
        let id = instance.id;

        {
            let store = JsonInstanceStore::new(dir.path());
            store.save(instance).await.unwrap();
        }

        let reopened = JsonInstanceStore::new(dir.path());
        assert!(reopened.find_by_id(id).await.unwrap().is_some());
    }
}
