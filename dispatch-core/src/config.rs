use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Full configuration surface from §6, deserializable from a pre-parsed
/// JSON tree. The core crate does not parse a document format itself —
/// callers (tests, or the server binary's thin loader) are expected to
/// hand in an already-parsed `serde_json::Value`/file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub global: GlobalConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub feedback: bool,
    #[serde(default)]
    pub echo: EchoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default)]
    pub mandatory: EchoMandatory,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            mandatory: EchoMandatory::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoMandatory {
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub loggingpath: Option<String>,
}

impl Default for EchoMandatory {
    fn default() -> Self {
        Self {
            verbose: true,
            logging: false,
            loggingpath: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub loop_forever: bool,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub filtering: FilteringConfig,
}

/// `class` selects a `StoreKind` from the registry; the remaining fields
/// are variant-specific and simply ignored by the variants that don't use
/// them, mirroring the source's single flat options block per backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub class: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub filetype: Option<String>,
    #[serde(default = "default_id_column")]
    pub resource_id_column: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_save_time_delta")]
    pub save_time_delta: u64,
    #[serde(default)]
    pub unique_resource_id: bool,
    #[serde(default)]
    pub on_duplicate_update: bool,
    #[serde(default)]
    pub size_threshold: Option<u64>,
    #[serde(default)]
    pub amount_threshold: Option<u64>,
    #[serde(default)]
    pub connargs: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub primary_key_column: Option<String>,
    #[serde(default = "default_select_cache_size")]
    pub select_cache_size: i64,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_status_column() -> String {
    "status".to_string()
}

fn default_save_time_delta() -> u64 {
    60
}

fn default_select_cache_size() -> i64 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilteringConfig {
    #[serde(default)]
    pub filter: Vec<FilterConfig>,
}

/// `class` selects a `FilterKind` from the registry; `name` defaults to
/// `class` when absent, per §3's filter-instance naming rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl FilterConfig {
    pub fn resolved_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal configuration document deserializes with the documented
    /// defaults applied to every omitted field.
    #[test]
    fn minimal_config_applies_defaults() {
        let doc = serde_json::json!({
            "global": {"connection": {"address": "0.0.0.0", "port": 9000}},
            "server": {"persistence": {"class": "MemoryStore"}},
        });
        let config: Configuration = serde_json::from_value(doc).unwrap();
        assert!(!config.global.feedback);
        assert!(config.global.echo.mandatory.verbose);
        assert_eq!(config.server.persistence.resource_id_column, "id");
        assert_eq!(config.server.persistence.save_time_delta, 60);
        assert!(config.server.filtering.filter.is_empty());
    }

    /// A filter entry without an explicit name falls back to its class.
    #[test]
    fn filter_name_defaults_to_class() {
        let filter = FilterConfig {
            class: "SaveResourcesFilter".to_string(),
            name: None,
            parallel: false,
            options: serde_json::Map::new(),
        };
        assert_eq!(filter.resolved_name(), "SaveResourcesFilter");
    }
}
