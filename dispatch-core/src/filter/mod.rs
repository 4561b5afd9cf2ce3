pub mod save_resources;

use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Extra data threaded through a sequential `apply`/`callback` chain. The
/// unmodified worker-supplied snapshot is placed under `"original"` before
/// the sequential callback chain runs, per §4.3.
pub type ExtraInfo = Map<String, Value>;

/// A hand-out or completion hook. Constructed fresh per connection, so
/// individual filter state need not be thread-safe. `apply` enriches a
/// hand-out; `callback` post-processes a completion. Every method takes
/// `&self` (interior mutability, if needed) so a filter can be shared via
/// `Arc` across the parallel stage's spawned tasks.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when a connection is opened.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Returns filter-specific data to merge into the hand-out payload.
    /// `extra_info` is shared across sequential filters in the same
    /// hand-out; parallel filters never see it (always `None`).
    async fn apply(
        &self,
        resource_id: &Value,
        resource_info: &Map<String, Value>,
        extra_info: Option<&mut ExtraInfo>,
    ) -> Result<Map<String, Value>>;

    /// Runs after the worker reports completion. Sequential filters share
    /// references to `resource_info`/`new_resources`/`extra_info` and may
    /// mutate them; parallel filters receive independent deep copies.
    async fn callback(
        &self,
        resource_id: &Value,
        resource_info: &mut Map<String, Value>,
        new_resources: &mut Vec<(Value, Map<String, Value>)>,
        extra_info: &mut ExtraInfo,
    ) -> Result<()>;

    /// Called once when a connection is finished.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    /// Called once per process during coordinator shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Whether a configured filter runs in the sequential stage or fans out in
/// its own task during the parallel stage. `Arc` (not `Box`) so a parallel
/// slot's filter can be cloned into its own `tokio::spawn`ed task.
pub struct FilterSlot {
    pub filter: Arc<dyn Filter>,
    pub parallel: bool,
}

/// Per-connection ordered sequential stage + fan-out parallel stage, per
/// §4.3. Constructed fresh per connection from the configured filter list.
pub struct FilterPipeline {
    slots: Vec<FilterSlot>,
}

impl FilterPipeline {
    pub fn new(slots: Vec<FilterSlot>) -> Self {
        Self { slots }
    }

    pub async fn setup(&self) -> Result<()> {
        for slot in &self.slots {
            slot.filter.setup().await?;
        }
        Ok(())
    }

    pub async fn finish(&self) -> Result<()> {
        for slot in &self.slots {
            slot.filter.finish().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        for slot in &self.slots {
            slot.filter.shutdown().await?;
        }
        Ok(())
    }

    /// Produces the per-hand-out filter data vector: sequential entries in
    /// configured order, followed by parallel entries as they complete.
    pub async fn apply(
        &self,
        resource_id: &Value,
        resource_info: &Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>> {
        let mut extra_info = ExtraInfo::new();
        let mut sequential_data = Vec::new();
        for slot in self.slots.iter().filter(|s| !s.parallel) {
            let data = slot
                .filter
                .apply(resource_id, resource_info, Some(&mut extra_info))
                .await?;
            sequential_data.push(data);
        }

        // Each parallel filter launches in its own task so a slow filter
        // never blocks the others, per §4.3/§5; joined before hand-out.
        let mut handles = Vec::new();
        for slot in self.slots.iter().filter(|s| s.parallel) {
            let filter = slot.filter.clone();
            let resource_id = resource_id.clone();
            let resource_info = resource_info.clone();
            handles.push(tokio::spawn(async move {
                filter.apply(&resource_id, &resource_info, None).await
            }));
        }
        for handle in handles {
            let data = handle
                .await
                .map_err(|e| CoordinatorError::Storage(format!("parallel filter task panicked: {e}")))??;
            sequential_data.push(data);
        }
        Ok(sequential_data)
    }

    /// Runs completion callbacks: sequential filters share mutable state
    /// (with `extra_info["original"]` seeded from the worker-supplied
    /// snapshot before the chain runs); parallel filters each get an
    /// isolated deep copy and may not observe each other's mutations.
    pub async fn callback(
        &self,
        resource_id: &Value,
        resource_info: &mut Map<String, Value>,
        new_resources: &mut Vec<(Value, Map<String, Value>)>,
        worker_extra_info: &Map<String, Value>,
    ) -> Result<()> {
        let mut extra_info = worker_extra_info.clone();
        let mut original = Map::new();
        original.insert(
            "original".to_string(),
            Value::Object(worker_extra_info.clone()),
        );
        extra_info.extend(original);

        for slot in self.slots.iter().filter(|s| !s.parallel) {
            slot.filter
                .callback(resource_id, resource_info, new_resources, &mut extra_info)
                .await?;
        }

        let mut handles = Vec::new();
        for slot in self.slots.iter().filter(|s| s.parallel) {
            let filter = slot.filter.clone();
            let resource_id = resource_id.clone();
            let mut info_copy = resource_info.clone();
            let mut new_resources_copy = new_resources.clone();
            let mut extra_info_copy = worker_extra_info.clone();
            handles.push(tokio::spawn(async move {
                filter
                    .callback(
                        &resource_id,
                        &mut info_copy,
                        &mut new_resources_copy,
                        &mut extra_info_copy,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| CoordinatorError::Storage(format!("parallel filter task panicked: {e}")))??;
        }
        Ok(())
    }
}

/// Static registry mapping configured filter class names to constructors,
/// per §9's "dynamic subclass lookup becomes a registry" design note.
pub type FilterFactory = fn(&Map<String, Value>) -> Result<Box<dyn Filter>>;

#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register("SaveResourcesFilter", save_resources::construct);
        registry
    }

    pub fn register(&mut self, class_name: &str, factory: FilterFactory) {
        self.factories.insert(class_name.to_string(), factory);
    }

    pub fn construct(&self, class_name: &str, config: &Map<String, Value>) -> Result<Box<dyn Filter>> {
        let factory = self.factories.get(class_name).ok_or_else(|| {
            crate::error::CoordinatorError::Storage(format!("unknown filter class: {class_name}"))
        })?;
        factory(config)
    }
}

/// Builds a fresh `FilterPipeline` for one connection from the configured
/// filter list, in configured order.
pub fn build_pipeline(
    configs: &[crate::config::FilterConfig],
    registry: &FilterRegistry,
) -> Result<FilterPipeline> {
    let mut slots = Vec::with_capacity(configs.len());
    for entry in configs {
        let mut options = entry.options.clone();
        options.insert(
            "name".to_string(),
            Value::String(entry.resolved_name().to_string()),
        );
        let filter: Arc<dyn Filter> = Arc::from(registry.construct(&entry.class, &options)?);
        slots.push(FilterSlot {
            filter,
            parallel: entry.parallel,
        });
    }
    Ok(FilterPipeline::new(slots))
}
