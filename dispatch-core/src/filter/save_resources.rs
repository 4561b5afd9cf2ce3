use super::{ExtraInfo, Filter};
use crate::error::Result;
use crate::store::ResourceStore;
use crate::store::memory::MemoryStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Reference filter: saves resources handed to it under its own name in
/// `extraInfo` (or `extraInfo["original"]` for sequential callbacks) into
/// its own private store, independent of the connection's main inventory.
///
/// Grounded on the source's `SaveResourcesFilter`, which owns a private
/// persistence handler and reads `extraInfo[self.name]`, falling back to
/// `extraInfo["original"][self.name]` when the direct key is absent.
pub struct SaveResourcesFilter {
    name: String,
    store: Arc<MemoryStore>,
}

impl SaveResourcesFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: Arc::new(MemoryStore::new(false, false)),
        }
    }

    fn extract<'a>(&self, extra_info: &'a Map<String, Value>) -> Option<&'a Value> {
        extra_info.get(&self.name).or_else(|| {
            extra_info
                .get("original")
                .and_then(|original| original.get(&self.name))
        })
    }
}

#[async_trait]
impl Filter for SaveResourcesFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(
        &self,
        _resource_id: &Value,
        _resource_info: &Map<String, Value>,
        _extra_info: Option<&mut ExtraInfo>,
    ) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }

    async fn callback(
        &self,
        resource_id: &Value,
        _resource_info: &mut Map<String, Value>,
        _new_resources: &mut Vec<(Value, Map<String, Value>)>,
        extra_info: &mut ExtraInfo,
    ) -> Result<()> {
        let Some(payload) = self.extract(extra_info) else {
            return Ok(());
        };
        let info = match payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert(self.name.clone(), other.clone());
                wrapped
            }
        };
        self.store.insert(vec![(resource_id.clone(), info)]).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.store.shutdown().await
    }
}

/// Constructor for the filter registry. `config` holds `{"name": "..."}`
/// as configured under §6's filter list.
pub fn construct(config: &Map<String, Value>) -> Result<Box<dyn Filter>> {
    let name = config
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("SaveResourcesFilter")
        .to_string();
    Ok(Box::new(SaveResourcesFilter::new(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn callback_saves_payload_under_own_name() {
        let filter = SaveResourcesFilter::new("pages");
        let mut extra_info = Map::new();
        let mut payload = Map::new();
        payload.insert("title".to_string(), Value::String("hello".to_string()));
        extra_info.insert("pages".to_string(), Value::Object(payload));

        let mut info = Map::new();
        let mut new_resources = Vec::new();
        filter
            .callback(&Value::from(1), &mut info, &mut new_resources, &mut extra_info)
            .await
            .unwrap();

        let counts = filter.store.count().await.unwrap();
        assert_eq!(counts.total, 1);
    }

    #[tokio::test]
    async fn callback_falls_back_to_original_snapshot() {
        let filter = SaveResourcesFilter::new("pages");
        let mut extra_info = Map::new();
        let mut original = Map::new();
        let mut payload = Map::new();
        payload.insert("title".to_string(), Value::String("hi".to_string()));
        original.insert("pages".to_string(), Value::Object(payload));
        extra_info.insert("original".to_string(), Value::Object(original));

        let mut info = Map::new();
        let mut new_resources = Vec::new();
        filter
            .callback(&Value::from(2), &mut info, &mut new_resources, &mut extra_info)
            .await
            .unwrap();

        let counts = filter.store.count().await.unwrap();
        assert_eq!(counts.total, 1);
    }

    #[tokio::test]
    async fn callback_is_noop_when_absent() {
        let filter = SaveResourcesFilter::new("pages");
        let mut extra_info = Map::new();
        let mut info = Map::new();
        let mut new_resources = Vec::new();
        filter
            .callback(&Value::from(3), &mut info, &mut new_resources, &mut extra_info)
            .await
            .unwrap();
        let counts = filter.store.count().await.unwrap();
        assert_eq!(counts.total, 0);
    }
}
