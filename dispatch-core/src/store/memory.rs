use super::{Lease, ResourceStore};
use crate::error::{CoordinatorError, Result};
use crate::types::{Resource, ResourceStatus, StoreCounts};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// A deterministic string key for a JSON-encodable resource id, used to
/// enforce `uniqueResourceId` without requiring `Value: Hash`.
fn id_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

struct Inner {
    resources: Vec<Resource>,
    available: VecDeque<usize>,
    in_progress: VecDeque<usize>,
    succeeded: VecDeque<usize>,
    failed: VecDeque<usize>,
    error: VecDeque<usize>,
    id_index: HashMap<String, usize>,
}

impl Inner {
    fn queue_mut(&mut self, status: ResourceStatus) -> &mut VecDeque<usize> {
        match status {
            ResourceStatus::Available => &mut self.available,
            ResourceStatus::InProgress => &mut self.in_progress,
            ResourceStatus::Succeeded => &mut self.succeeded,
            ResourceStatus::Failed => &mut self.failed,
            ResourceStatus::Error => &mut self.error,
        }
    }
}

/// In-memory inventory: a vector of resources plus five per-status index
/// queues. `available` preserves FIFO hand-out order; the others are
/// unordered bookkeeping used by `reset` and `count`.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    unique_resource_id: bool,
    on_duplicate_update: bool,
}

impl MemoryStore {
    pub fn new(unique_resource_id: bool, on_duplicate_update: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                resources: Vec::new(),
                available: VecDeque::new(),
                in_progress: VecDeque::new(),
                succeeded: VecDeque::new(),
                failed: VecDeque::new(),
                error: VecDeque::new(),
                id_index: HashMap::new(),
            }),
            unique_resource_id,
            on_duplicate_update,
        }
    }

    /// Preloads resources already carrying a status, for use by `FileStore`
    /// reloading from disk.
    pub fn with_resources(
        unique_resource_id: bool,
        on_duplicate_update: bool,
        resources: Vec<Resource>,
    ) -> Result<Self> {
        let mut inner = Inner {
            resources: Vec::with_capacity(resources.len()),
            available: VecDeque::new(),
            in_progress: VecDeque::new(),
            succeeded: VecDeque::new(),
            failed: VecDeque::new(),
            error: VecDeque::new(),
            id_index: HashMap::new(),
        };
        for (idx, resource) in resources.into_iter().enumerate() {
            if unique_resource_id {
                let key = id_key(&resource.id);
                if inner.id_index.insert(key, idx).is_some() {
                    return Err(CoordinatorError::DuplicateId(resource.id.to_string()));
                }
            }
            inner.queue_mut(resource.status).push_back(idx);
            inner.resources.push(resource);
        }
        Ok(Self {
            inner: RwLock::new(inner),
            unique_resource_id,
            on_duplicate_update,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl MemoryStore {
    /// Full inventory snapshot, used by `FileStore`/`RolloverFileStore` to
    /// dump to disk.
    pub async fn all_resources(&self) -> Vec<Resource> {
        self.inner.read().await.resources.clone()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn select(&self) -> Result<Lease> {
        let mut inner = self.inner.write().await;
        let Some(idx) = inner.available.pop_front() else {
            return Ok(None);
        };
        inner.in_progress.push_back(idx);
        let resource = &mut inner.resources[idx];
        resource.status = ResourceStatus::InProgress;
        Ok(Some((idx as u64, resource.id.clone(), resource.info.clone())))
    }

    async fn update(
        &self,
        key: u64,
        status: ResourceStatus,
        info: Map<String, Value>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let idx = key as usize;
        let old_status = inner
            .resources
            .get(idx)
            .ok_or_else(|| CoordinatorError::Storage(format!("unknown resource key {key}")))?
            .status;
        let old_queue = inner.queue_mut(old_status);
        if let Some(pos) = old_queue.iter().position(|&i| i == idx) {
            old_queue.remove(pos);
        }
        inner.queue_mut(status).push_back(idx);
        let resource = &mut inner.resources[idx];
        resource.status = status;
        if !info.is_empty() {
            resource.info.extend(info);
        }
        Ok(())
    }

    async fn insert(&self, resources: Vec<(Value, Map<String, Value>)>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for (id, info) in resources {
            let key = self.unique_resource_id.then(|| id_key(&id));
            if let Some(key) = &key {
                if let Some(&idx) = inner.id_index.get(key) {
                    if self.on_duplicate_update {
                        inner.resources[idx].info.extend(info);
                        continue;
                    }
                    return Err(CoordinatorError::DuplicateId(id.to_string()));
                }
            }
            let idx = inner.resources.len();
            if let Some(key) = key {
                inner.id_index.insert(key, idx);
            }
            inner.available.push_back(idx);
            inner.resources.push(Resource {
                key: idx as u64,
                id,
                status: ResourceStatus::Available,
                info,
            });
        }
        Ok(())
    }

    async fn count(&self) -> Result<StoreCounts> {
        let inner = self.inner.read().await;
        Ok(StoreCounts {
            total: inner.resources.len() as u64,
            succeeded: inner.succeeded.len() as u64,
            in_progress: inner.in_progress.len() as u64,
            available: inner.available.len() as u64,
            failed: inner.failed.len() as u64,
            error: inner.error.len() as u64,
        })
    }

    async fn reset(&self, status: ResourceStatus) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let drained: Vec<usize> = inner.queue_mut(status).drain(..).collect();
        let count = drained.len() as u64;
        for idx in drained {
            inner.resources[idx].status = ResourceStatus::Available;
            inner.available.push_back(idx);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    /// Insert then select returns the inserted resource and flips it to IN_PROGRESS.
    #[tokio::test]
    async fn select_after_insert_leases_available() {
        let store = MemoryStore::default();
        store
            .insert(vec![(Value::from(1), info(&[("k", "v")]))])
            .await
            .unwrap();
        let (key, id, leased_info) = store.select().await.unwrap().unwrap();
        assert_eq!(id, Value::from(1));
        assert_eq!(leased_info.get("k").unwrap(), "v");
        let counts = store.count().await.unwrap();
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.available, 0);
        assert_eq!(counts.total, 1);
        let _ = key;
    }

    /// select on an empty store returns None rather than an error.
    #[tokio::test]
    async fn select_on_empty_store_returns_none() {
        let store = MemoryStore::default();
        assert!(store.select().await.unwrap().is_none());
    }

    /// update merges info (shallow) rather than replacing it, per §4.2.
    #[tokio::test]
    async fn update_merges_info_shallow() {
        let store = MemoryStore::default();
        store
            .insert(vec![(Value::from(1), info(&[("a", "1")]))])
            .await
            .unwrap();
        let (key, _, _) = store.select().await.unwrap().unwrap();
        store
            .update(key, ResourceStatus::Succeeded, info(&[("b", "2")]))
            .await
            .unwrap();
        let counts = store.count().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.in_progress, 0);
    }

    /// reset moves every resource at a status back to AVAILABLE and reports the count.
    #[tokio::test]
    async fn reset_moves_status_to_available() {
        let store = MemoryStore::default();
        store
            .insert(vec![
                (Value::from(1), Map::new()),
                (Value::from(2), Map::new()),
            ])
            .await
            .unwrap();
        let (k1, _, _) = store.select().await.unwrap().unwrap();
        store
            .update(k1, ResourceStatus::Failed, Map::new())
            .await
            .unwrap();
        let reset_count = store.reset(ResourceStatus::Failed).await.unwrap();
        assert_eq!(reset_count, 1);
        let counts = store.count().await.unwrap();
        assert_eq!(counts.available, 2);
        assert_eq!(counts.failed, 0);
    }

    /// unique_resource_id rejects a duplicate id unless on_duplicate_update is set.
    #[tokio::test]
    async fn duplicate_id_rejected_without_on_duplicate_update() {
        let store = MemoryStore::new(true, false);
        store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();
        let err = store
            .insert(vec![(Value::from(1), Map::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateId(_)));
    }

    /// with on_duplicate_update, a duplicate insert merges info without creating a new resource.
    #[tokio::test]
    async fn duplicate_id_merges_info_when_allowed() {
        let store = MemoryStore::new(true, true);
        store
            .insert(vec![(Value::from(1), info(&[("a", "1")]))])
            .await
            .unwrap();
        store
            .insert(vec![(Value::from(1), info(&[("b", "2")]))])
            .await
            .unwrap();
        let counts = store.count().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.available, 1);
    }

    /// available hand-out is FIFO in insertion order.
    #[tokio::test]
    async fn select_is_fifo() {
        let store = MemoryStore::default();
        store
            .insert(vec![(Value::from(1), Map::new()), (Value::from(2), Map::new())])
            .await
            .unwrap();
        let (_, first, _) = store.select().await.unwrap().unwrap();
        let (_, second, _) = store.select().await.unwrap().unwrap();
        assert_eq!(first, Value::from(1));
        assert_eq!(second, Value::from(2));
    }
}
