//! External service collaborators injected into steps.
//!
//! The engine never calls these directly; they are constructor arguments to
//! the steps that need them. The in-memory implementations back tests and
//! local runs, and deliberately make create/delete idempotent the same way
//! the real cloud APIs are used: check for the effect before producing it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// Object storage client: buckets of named blobs.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;
    async fn create_bucket(&self, bucket: &str) -> Result<()>;
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool>;
    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Data warehouse client: datasets and the snapshot views cut from them.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;
    async fn create_dataset(&self, dataset: &str) -> Result<()>;
    async fn delete_dataset(&self, dataset: &str) -> Result<()>;
    async fn snapshot_exists(&self, snapshot: &str) -> Result<bool>;
    async fn create_snapshot_view(&self, snapshot: &str, source_dataset: &str) -> Result<()>;
    async fn delete_snapshot_view(&self, snapshot: &str) -> Result<()>;
}

/// Identity/access management client: resources with access policies.
#[async_trait]
pub trait IamClient: Send + Sync {
    async fn resource_exists(&self, kind: &str, id: &str) -> Result<bool>;
    async fn create_resource(&self, kind: &str, id: &str) -> Result<()>;
    async fn delete_resource(&self, kind: &str, id: &str) -> Result<()>;
}

/// The typed collaborator bundle handed to the workflow definition builders.
/// Steps receive exactly the clients they need from here; nothing is looked
/// up by name at runtime.
#[derive(Clone)]
pub struct Services {
    pub object_store: std::sync::Arc<dyn ObjectStoreClient>,
    pub warehouse: std::sync::Arc<dyn WarehouseClient>,
    pub iam: std::sync::Arc<dyn IamClient>,
}

impl Services {
    /// All-in-memory bundle for tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            object_store: std::sync::Arc::new(InMemoryObjectStore::new()),
            warehouse: std::sync::Arc::new(InMemoryWarehouse::new()),
            iam: std::sync::Arc::new(InMemoryIam::new()),
        }
    }
}

// --- In-memory implementations ---

pub struct InMemoryObjectStore {
    buckets: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().unwrap().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.lock().unwrap().remove(bucket);
        Ok(())
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .is_some_and(|b| b.contains_key(key)))
    }

    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(bucket_map) = buckets.get_mut(bucket) else {
            bail!("bucket does not exist: {}", bucket);
        };
        bucket_map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(bucket_map) = self.buckets.lock().unwrap().get_mut(bucket) {
            bucket_map.remove(key);
        }
        Ok(())
    }
}

pub struct InMemoryWarehouse {
    datasets: Mutex<HashSet<String>>,
    // snapshot name → source dataset
    snapshots: Mutex<HashMap<String, String>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self {
            datasets: Mutex::new(HashSet::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseClient for InMemoryWarehouse {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.datasets.lock().unwrap().contains(dataset))
    }

    async fn create_dataset(&self, dataset: &str) -> Result<()> {
        self.datasets.lock().unwrap().insert(dataset.to_string());
        Ok(())
    }

    async fn delete_dataset(&self, dataset: &str) -> Result<()> {
        self.datasets.lock().unwrap().remove(dataset);
        Ok(())
    }

    async fn snapshot_exists(&self, snapshot: &str) -> Result<bool> {
        Ok(self.snapshots.lock().unwrap().contains_key(snapshot))
    }

    async fn create_snapshot_view(&self, snapshot: &str, source_dataset: &str) -> Result<()> {
        if !self.datasets.lock().unwrap().contains(source_dataset) {
            bail!("source dataset does not exist: {}", source_dataset);
        }
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.to_string(), source_dataset.to_string());
        Ok(())
    }

    async fn delete_snapshot_view(&self, snapshot: &str) -> Result<()> {
        self.snapshots.lock().unwrap().remove(snapshot);
        Ok(())
    }
}

pub struct InMemoryIam {
    resources: Mutex<HashSet<(String, String)>>,
}

impl InMemoryIam {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for InMemoryIam {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IamClient for InMemoryIam {
    async fn resource_exists(&self, kind: &str, id: &str) -> Result<bool> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .contains(&(kind.to_string(), id.to_string())))
    }

    async fn create_resource(&self, kind: &str, id: &str) -> Result<()> {
        self.resources
            .lock()
            .unwrap()
            .insert((kind.to_string(), id.to_string()));
        Ok(())
    }

    async fn delete_resource(&self, kind: &str, id: &str) -> Result<()> {
        self.resources
            .lock()
            .unwrap()
            .remove(&(kind.to_string(), id.to_string()));
        Ok(())
    }
}
