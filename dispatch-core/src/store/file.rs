use super::memory::MemoryStore;
use super::{Lease, ResourceStore};
use crate::error::{CoordinatorError, Result};
use crate::types::{Resource, ResourceStatus, StoreCounts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// The two built-in on-disk formats. Additional formats would implement the
/// same load/dump pair and plug in through `FileFormat` rather than through
/// a separate store type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    pub fn from_extension(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            other => Err(CoordinatorError::UnknownFileType(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct JsonDocument {
    columns: Vec<String>,
    resources: Vec<JsonResource>,
}

#[derive(Serialize, Deserialize)]
struct JsonResource {
    id: Value,
    #[serde(default)]
    status: Option<i8>,
    #[serde(flatten)]
    info: Map<String, Value>,
}

fn load_json(path: &Path) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path)?;
    let doc: JsonDocument = serde_json::from_str(&text)?;
    Ok(doc
        .resources
        .into_iter()
        .enumerate()
        .map(|(idx, r)| Resource {
            key: idx as u64,
            id: r.id,
            status: r
                .status
                .and_then(ResourceStatus::from_i8)
                .unwrap_or(ResourceStatus::Available),
            info: r.info,
        })
        .collect())
}

fn dump_json(path: &Path, resources: &[Resource]) -> Result<()> {
    let mut columns = Vec::new();
    for resource in resources {
        for key in resource.info.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    let doc = JsonDocument {
        columns,
        resources: resources
            .iter()
            .map(|r| JsonResource {
                id: r.id.clone(),
                status: Some(r.status.as_i8()),
                info: r.info.clone(),
            })
            .collect(),
    };
    atomic_write(path, &serde_json::to_vec_pretty(&doc)?)
}

/// CSV cell parsing per §4.2: empty -> null, `T`/`F` -> bool, a
/// doublequote-wrapped token -> string, otherwise int/float/null inference.
fn parse_csv_cell(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if raw == "T" {
        return Value::Bool(true);
    }
    if raw == "F" {
        return Value::Bool(false);
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if raw == "null" {
        return Value::Null;
    }
    Value::String(raw.to_string())
}

fn format_csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "T".to_string(),
        Value::Bool(false) => "F".to_string(),
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}

fn load_csv(path: &Path, id_column: &str, status_column: &str) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header: Vec<&str> = match lines.next() {
        Some(h) => h.split(',').collect(),
        None => return Ok(Vec::new()),
    };
    let id_idx = header.iter().position(|h| *h == id_column).ok_or_else(|| {
        CoordinatorError::Storage(format!("csv missing id column {id_column}"))
    })?;
    let status_idx = header.iter().position(|h| *h == status_column);

    let mut resources = Vec::new();
    for (row_idx, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        let id = parse_csv_cell(cells.get(id_idx).copied().unwrap_or(""));
        let status = status_idx
            .and_then(|i| cells.get(i))
            .and_then(|c| c.parse::<i8>().ok())
            .and_then(ResourceStatus::from_i8)
            .unwrap_or(ResourceStatus::Available);
        let mut info = Map::new();
        for (col_idx, col_name) in header.iter().enumerate() {
            if col_idx == id_idx || Some(col_idx) == status_idx {
                continue;
            }
            info.insert(
                col_name.to_string(),
                parse_csv_cell(cells.get(col_idx).copied().unwrap_or("")),
            );
        }
        resources.push(Resource {
            key: row_idx as u64,
            id,
            status,
            info,
        });
    }
    Ok(resources)
}

fn dump_csv(path: &Path, resources: &[Resource], id_column: &str, status_column: &str) -> Result<()> {
    let mut columns = Vec::new();
    for resource in resources {
        for key in resource.info.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    let mut out = String::new();
    out.push_str(id_column);
    out.push(',');
    out.push_str(status_column);
    for col in &columns {
        out.push(',');
        out.push_str(col);
    }
    out.push('\n');
    for resource in resources {
        out.push_str(&format_csv_cell(&resource.id));
        out.push(',');
        out.push_str(&resource.status.as_i8().to_string());
        for col in &columns {
            out.push(',');
            out.push_str(&format_csv_cell(resource.info.get(col).unwrap_or(&Value::Null)));
        }
        out.push('\n');
    }
    atomic_write(path, out.as_bytes())
}

/// Writes to a sibling temp file then renames over the live path, so a
/// dump failure never leaves a truncated file in place.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("dump")
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// File-backed store: a `MemoryStore` preloaded from disk, with a
/// background timer re-dumping the whole inventory to disk periodically.
pub struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
    format: FileFormat,
    id_column: String,
    status_column: String,
    aborted: AtomicBool,
    dump_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl FileStore {
    pub async fn open(
        path: impl Into<PathBuf>,
        format: Option<FileFormat>,
        id_column: impl Into<String>,
        status_column: impl Into<String>,
        unique_resource_id: bool,
        on_duplicate_update: bool,
        save_time_delta: Duration,
    ) -> Result<std::sync::Arc<Self>> {
        let path = path.into();
        let format = match format {
            Some(f) => f,
            None => FileFormat::from_extension(&path)?,
        };
        let id_column = id_column.into();
        let status_column = status_column.into();
        let resources = if path.exists() {
            match format {
                FileFormat::Json => load_json(&path)?,
                FileFormat::Csv => load_csv(&path, &id_column, &status_column)?,
            }
        } else {
            Vec::new()
        };
        let memory = MemoryStore::with_resources(unique_resource_id, on_duplicate_update, resources)?;
        let store = std::sync::Arc::new(Self {
            memory,
            path,
            format,
            id_column,
            status_column,
            aborted: AtomicBool::new(false),
            dump_task: AsyncMutex::new(None),
        });
        store.clone().arm_timer(save_time_delta);
        Ok(store)
    }

    /// The underlying in-memory store, for callers (e.g. `RolloverFileStore`)
    /// that need to inspect the full inventory directly.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Current size of the backing file, for rollover's size threshold.
    pub fn on_disk_size(&self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn check_aborted(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Storage(
                "file store aborted after a prior dump failure".into(),
            ));
        }
        Ok(())
    }

    async fn dump_now(&self) -> Result<()> {
        let resources = self.snapshot().await;
        let path = self.path.clone();
        let format = self.format;
        let id_column = self.id_column.clone();
        let status_column = self.status_column.clone();
        let result = tokio::task::spawn_blocking(move || match format {
            FileFormat::Json => dump_json(&path, &resources),
            FileFormat::Csv => dump_csv(&path, &resources, &id_column, &status_column),
        })
        .await
        .map_err(|e| CoordinatorError::Storage(e.to_string()))?;
        if result.is_err() {
            self.aborted.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn snapshot(&self) -> Vec<Resource> {
        self.memory.all_resources().await
    }

    /// One-shot, self-re-arming timer per §4.2's "re-armed one-shot" note.
    fn arm_timer(self: std::sync::Arc<Self>, delay: Duration) {
        let task_self = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if task_self.aborted.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = task_self.dump_now().await {
                    tracing::error!(error = %err, "file store background dump failed");
                    break;
                }
            }
        });
        if let Ok(mut guard) = self.dump_task.try_lock() {
            *guard = Some(handle);
        }
    }
}

#[async_trait]
impl ResourceStore for FileStore {
    async fn select(&self) -> Result<Lease> {
        self.check_aborted()?;
        self.memory.select().await
    }

    async fn update(&self, key: u64, status: ResourceStatus, info: Map<String, Value>) -> Result<()> {
        self.check_aborted()?;
        self.memory.update(key, status, info).await
    }

    async fn insert(&self, resources: Vec<(Value, Map<String, Value>)>) -> Result<()> {
        self.check_aborted()?;
        self.memory.insert(resources).await
    }

    async fn count(&self) -> Result<StoreCounts> {
        self.check_aborted()?;
        self.memory.count().await
    }

    async fn reset(&self, status: ResourceStatus) -> Result<u64> {
        self.check_aborted()?;
        self.memory.reset(status).await
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.dump_task.lock().await.take() {
            handle.abort();
        }
        self.dump_now().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A resource inserted, then shut down (forcing a final dump), reloads
    /// from disk with the same id and info after reopening the store.
    #[tokio::test]
    async fn reload_after_shutdown_dump_preserves_resources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");

        let store = FileStore::open(
            &path,
            Some(FileFormat::Json),
            "id",
            "status",
            true,
            false,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        let mut info = Map::new();
        info.insert("k".to_string(), Value::String("v".to_string()));
        store.insert(vec![(Value::from(100), info)]).await.unwrap();
        store.shutdown().await.unwrap();

        let reopened = FileStore::open(
            &path,
            Some(FileFormat::Json),
            "id",
            "status",
            true,
            false,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        let counts = reopened.count().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.available, 1);
        reopened.shutdown().await.unwrap();
    }

    /// CSV cell parsing recognizes T/F booleans, empty-as-null, and numbers.
    #[test]
    fn csv_cell_parsing_matches_spec_rules() {
        assert_eq!(parse_csv_cell(""), Value::Null);
        assert_eq!(parse_csv_cell("T"), Value::Bool(true));
        assert_eq!(parse_csv_cell("F"), Value::Bool(false));
        assert_eq!(parse_csv_cell("\"hi\""), Value::String("hi".to_string()));
        assert_eq!(parse_csv_cell("42"), Value::Number(42.into()));
    }
}
