pub mod memory;
pub mod file;
pub mod rollover;

#[cfg(feature = "postgres")]
pub mod db;

use crate::config::PersistenceConfig;
use crate::error::{CoordinatorError, Result};
use crate::types::StoreCounts;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A (key, id, info) triple describing one leased resource, or the nil
/// triple when nothing is AVAILABLE.
pub type Lease = Option<(u64, Value, Map<String, Value>)>;

/// Persistence contract shared by all inventory backends. The handler
/// operates exclusively through this trait, so `MemoryStore`, `FileStore`,
/// `RolloverFileStore` and `DbStore` are interchangeable at construction
/// time.
///
/// ── Connection lifecycle ──
/// `setup`/`finish` bracket a single connection; `shutdown` runs once when
/// the process tears down.
///
/// ── Inventory operations ──
/// `select`, `update`, `insert`, `count`, `reset` implement §4.2's contract.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Per-connection initialization (e.g. open a pooled connection).
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Atomically leases the next AVAILABLE resource, transitioning it to
    /// IN_PROGRESS before returning. Returns `None` when none is available.
    async fn select(&self) -> Result<Lease>;

    /// Sets a resource's new status. When `info` is non-empty it is shallow
    /// merged into the existing info (new keys win on collision);
    /// otherwise the existing info is left untouched.
    async fn update(&self, key: u64, status: crate::types::ResourceStatus, info: Map<String, Value>) -> Result<()>;

    /// Bulk-appends resources. Duplicate ids under `unique_resource_id` are
    /// an error unless `on_duplicate_update` is set, in which case the
    /// existing record's info is merged (status is left untouched).
    async fn insert(&self, resources: Vec<(Value, Map<String, Value>)>) -> Result<()>;

    /// Returns (total, succeeded, in_progress, available, failed, error).
    async fn count(&self) -> Result<StoreCounts>;

    /// Moves every resource at `status` back to AVAILABLE, returning the
    /// number affected.
    async fn reset(&self, status: crate::types::ResourceStatus) -> Result<u64>;

    /// Per-connection release.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    /// Process-wide release, called once during coordinator shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the configured persistence backend, resolving `class` against
/// the known store kinds (`MemoryStore`, `FileStore`, `RolloverFileStore`,
/// `DbStore`) per the Design Notes' "dynamic subclass lookup becomes a
/// registry" guidance. Unknown classes are a startup-time error, not a
/// panic.
pub async fn build_store(config: &PersistenceConfig) -> Result<Arc<dyn ResourceStore>> {
    match config.class.as_str() {
        "MemoryStore" => Ok(Arc::new(memory::MemoryStore::new(
            config.unique_resource_id,
            config.on_duplicate_update,
        ))),
        "FileStore" => {
            let filename = config
                .filename
                .clone()
                .ok_or_else(|| CoordinatorError::Storage("FileStore requires filename".into()))?;
            let format = match config.filetype.as_deref() {
                Some("csv") => Some(file::FileFormat::Csv),
                Some("json") => Some(file::FileFormat::Json),
                Some(other) => return Err(CoordinatorError::UnknownFileType(other.to_string())),
                None => None,
            };
            let store = file::FileStore::open(
                PathBuf::from(filename),
                format,
                config.resource_id_column.clone(),
                config.status_column.clone(),
                config.unique_resource_id,
                config.on_duplicate_update,
                Duration::from_secs(config.save_time_delta),
            )
            .await?;
            Ok(store as Arc<dyn ResourceStore>)
        }
        "RolloverFileStore" => {
            let filename = config.filename.clone().ok_or_else(|| {
                CoordinatorError::Storage("RolloverFileStore requires filename".into())
            })?;
            let format = match config.filetype.as_deref() {
                Some("csv") => file::FileFormat::Csv,
                Some("json") | None => file::FileFormat::Json,
                Some(other) => return Err(CoordinatorError::UnknownFileType(other.to_string())),
            };
            let store = rollover::RolloverFileStore::open(
                PathBuf::from(filename),
                format,
                config.resource_id_column.clone(),
                config.status_column.clone(),
                config.unique_resource_id,
                config.on_duplicate_update,
                Duration::from_secs(config.save_time_delta),
                config.size_threshold,
                config.amount_threshold,
            )
            .await?;
            Ok(store as Arc<dyn ResourceStore>)
        }
        #[cfg(feature = "postgres")]
        "DbStore" => {
            let connargs = config
                .connargs
                .clone()
                .ok_or_else(|| CoordinatorError::Storage("DbStore requires connargs".into()))?;
            let table = config
                .table
                .clone()
                .ok_or_else(|| CoordinatorError::Storage("DbStore requires table".into()))?;
            let pk = config.primary_key_column.clone().ok_or_else(|| {
                CoordinatorError::Storage("DbStore requires primaryKeyColumn".into())
            })?;
            let pool = sqlx::PgPool::connect(&connargs)
                .await
                .map_err(CoordinatorError::Database)?;
            let store = db::DbStore::connect(
                pool,
                table,
                pk,
                config.resource_id_column.clone(),
                config.status_column.clone(),
                config.unique_resource_id,
                config.on_duplicate_update,
                config.select_cache_size,
            )
            .await?;
            Ok(Arc::new(store) as Arc<dyn ResourceStore>)
        }
        other => Err(CoordinatorError::Storage(format!(
            "unknown persistence class: {other}"
        ))),
    }
}
