use super::file::{FileFormat, FileStore};
use super::{Lease, ResourceStore};
use crate::error::{CoordinatorError, Result};
use crate::types::{ResourceStatus, StoreCounts};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Global lease key routing: the high 32 bits select the owning file store,
/// the low 32 bits are that store's own local key.
fn pack_key(store_idx: usize, local_key: u64) -> u64 {
    ((store_idx as u64) << 32) | (local_key & 0xffff_ffff)
}

fn unpack_key(key: u64) -> (usize, u64) {
    ((key >> 32) as usize, key & 0xffff_ffff)
}

fn id_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

/// A set of file stores, rolling over to a new file when a size or count
/// threshold is exceeded. Discovers existing `<base>`, `<base>.1`,
/// `<base>.2`, … files on open and resumes appending after the highest
/// observed suffix.
pub struct RolloverFileStore {
    stores: RwLock<Vec<Arc<FileStore>>>,
    id_owner: RwLock<HashMap<String, usize>>,
    active_index: AtomicUsize,
    next_suffix: AtomicUsize,
    base_path: PathBuf,
    format: FileFormat,
    id_column: String,
    status_column: String,
    unique_resource_id: bool,
    on_duplicate_update: bool,
    save_time_delta: Duration,
    size_threshold: Option<u64>,
    amount_threshold: Option<u64>,
}

impl RolloverFileStore {
    pub async fn open(
        base_path: impl Into<PathBuf>,
        format: FileFormat,
        id_column: impl Into<String>,
        status_column: impl Into<String>,
        unique_resource_id: bool,
        on_duplicate_update: bool,
        save_time_delta: Duration,
        size_threshold: Option<u64>,
        amount_threshold: Option<u64>,
    ) -> Result<Arc<Self>> {
        let base_path = base_path.into();
        let id_column = id_column.into();
        let status_column = status_column.into();

        let existing = discover_rollover_files(&base_path);
        let max_suffix = existing.iter().map(|(n, _)| *n).max();
        let mut stores = Vec::new();
        let mut id_owner = HashMap::new();
        for (idx, (_, path)) in existing.iter().enumerate() {
            let store = FileStore::open(
                path.clone(),
                Some(format),
                id_column.clone(),
                status_column.clone(),
                unique_resource_id,
                on_duplicate_update,
                save_time_delta,
            )
            .await?;
            if unique_resource_id {
                for resource in store.memory().all_resources().await {
                    id_owner.insert(id_key(&resource.id), idx);
                }
            }
            stores.push(store);
        }
        let next_suffix = max_suffix.map(|n| n + 1).unwrap_or(1);
        if stores.is_empty() {
            let store = FileStore::open(
                base_path.clone(),
                Some(format),
                id_column.clone(),
                status_column.clone(),
                unique_resource_id,
                on_duplicate_update,
                save_time_delta,
            )
            .await?;
            stores.push(store);
        }
        let active_index = stores.len() - 1;

        Ok(Arc::new(Self {
            stores: RwLock::new(stores),
            id_owner: RwLock::new(id_owner),
            active_index: AtomicUsize::new(active_index),
            next_suffix: AtomicUsize::new(next_suffix),
            base_path,
            format,
            id_column,
            status_column,
            unique_resource_id,
            on_duplicate_update,
            save_time_delta,
            size_threshold,
            amount_threshold,
        }))
    }

    fn rollover_path(&self, suffix: usize) -> PathBuf {
        if suffix == 0 {
            self.base_path.clone()
        } else {
            let mut name = self.base_path.clone().into_os_string();
            name.push(format!(".{suffix}"));
            PathBuf::from(name)
        }
    }

    async fn active_exceeds_threshold(&self, active: &Arc<FileStore>) -> Result<bool> {
        if let Some(limit) = self.amount_threshold {
            if active.count().await?.total >= limit {
                return Ok(true);
            }
        }
        if let Some(limit) = self.size_threshold {
            if active.on_disk_size().unwrap_or(0) >= limit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn maybe_rollover(&self) -> Result<()> {
        let active_idx = self.active_index.load(Ordering::SeqCst);
        let active = self.stores.read().await[active_idx].clone();
        if !self.active_exceeds_threshold(&active).await? {
            return Ok(());
        }
        let suffix = self.next_suffix.fetch_add(1, Ordering::SeqCst);
        let path = self.rollover_path(suffix);
        let new_store = FileStore::open(
            path,
            Some(self.format),
            self.id_column.clone(),
            self.status_column.clone(),
            self.unique_resource_id,
            self.on_duplicate_update,
            self.save_time_delta,
        )
        .await?;
        let mut stores = self.stores.write().await;
        stores.push(new_store);
        self.active_index.store(stores.len() - 1, Ordering::SeqCst);
        Ok(())
    }
}

/// Discovers `<base>` and any `<base>.<N>` siblings, returning
/// `(suffix, path)` pairs sorted by suffix (base file is suffix 0).
fn discover_rollover_files(base_path: &Path) -> Vec<(usize, PathBuf)> {
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    if base_path.exists() {
        found.push((0, base_path.to_path_buf()));
    }
    let dir = base_path.parent().unwrap_or_else(|| Path::new("."));
    let base_name = base_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let prefix = format!("{base_name}.");
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if let Ok(n) = suffix.parse::<usize>() {
                    found.push((n, entry.path()));
                }
            }
        }
    }
    found.sort_by_key(|(n, _)| *n);
    found
}

#[async_trait]
impl ResourceStore for RolloverFileStore {
    async fn select(&self) -> Result<Lease> {
        let stores = self.stores.read().await;
        for (idx, store) in stores.iter().enumerate() {
            if let Some((local_key, id, info)) = store.select().await? {
                return Ok(Some((pack_key(idx, local_key), id, info)));
            }
        }
        Ok(None)
    }

    async fn update(&self, key: u64, status: ResourceStatus, info: Map<String, Value>) -> Result<()> {
        let (store_idx, local_key) = unpack_key(key);
        let stores = self.stores.read().await;
        let store = stores
            .get(store_idx)
            .ok_or_else(|| CoordinatorError::Storage(format!("unknown rollover store {store_idx}")))?;
        store.update(local_key, status, info).await
    }

    async fn insert(&self, resources: Vec<(Value, Map<String, Value>)>) -> Result<()> {
        for (id, info) in resources {
            let owner = if self.unique_resource_id {
                self.id_owner.read().await.get(&id_key(&id)).copied()
            } else {
                None
            };
            if let Some(store_idx) = owner {
                let stores = self.stores.read().await;
                stores[store_idx].insert(vec![(id, info)]).await?;
                continue;
            }
            let active_idx = self.active_index.load(Ordering::SeqCst);
            {
                let stores = self.stores.read().await;
                stores[active_idx].insert(vec![(id.clone(), info)]).await?;
            }
            if self.unique_resource_id {
                self.id_owner
                    .write()
                    .await
                    .insert(id_key(&id), active_idx);
            }
        }
        self.maybe_rollover().await
    }

    async fn count(&self) -> Result<StoreCounts> {
        let stores = self.stores.read().await;
        let mut total = StoreCounts::default();
        for store in stores.iter() {
            let c = store.count().await?;
            total.total += c.total;
            total.succeeded += c.succeeded;
            total.in_progress += c.in_progress;
            total.available += c.available;
            total.failed += c.failed;
            total.error += c.error;
        }
        Ok(total)
    }

    async fn reset(&self, status: ResourceStatus) -> Result<u64> {
        let stores = self.stores.read().await;
        let mut total = 0;
        for store in stores.iter() {
            total += store.reset(status).await?;
        }
        Ok(total)
    }

    async fn shutdown(&self) -> Result<()> {
        let stores = self.stores.read().await;
        for store in stores.iter() {
            store.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inserting past the count threshold opens a second `<base>.1` file
    /// and routes further inserts there.
    #[tokio::test]
    async fn rollover_opens_new_file_past_count_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("resources.json");
        let store = RolloverFileStore::open(
            &base,
            FileFormat::Json,
            "id",
            "status",
            true,
            false,
            Duration::from_secs(3600),
            None,
            Some(1),
        )
        .await
        .unwrap();

        store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();
        store.insert(vec![(Value::from(2), Map::new())]).await.unwrap();

        let counts = store.count().await.unwrap();
        assert_eq!(counts.total, 2);
        assert!(dir.path().join("resources.json.1").exists());
    }

    /// Uniqueness is enforced across the union of rollover files.
    #[tokio::test]
    async fn duplicate_id_rejected_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("resources.json");
        let store = RolloverFileStore::open(
            &base,
            FileFormat::Json,
            "id",
            "status",
            true,
            false,
            Duration::from_secs(3600),
            None,
            Some(1),
        )
        .await
        .unwrap();
        store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();
        store.insert(vec![(Value::from(2), Map::new())]).await.unwrap();
        let err = store.insert(vec![(Value::from(1), Map::new())]).await;
        assert!(err.is_err());
    }
}
