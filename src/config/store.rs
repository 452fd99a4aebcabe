//! Read-only store of migration configurations
//!
//! A configuration pairs a source instance with a destination instance and
//! an ordered set of data-item configs. Documents are JSON, one per file,
//! named `{configId}.json` under the configured directory. The store is
//! loaded once at startup; handlers only ever read it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::planner::periods::PeriodType;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot read config directory {path}: {source}")]
    ReadDir {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("config file {path} is malformed: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },

    #[error("config {0} declares no data items")]
    NoDataItems(String),
}

/// One side of a migration: a DHIS2-compatible instance
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Route identifier for proxying source reads through the destination
    #[serde(default)]
    pub route_id: Option<String>,
}

/// A `{sourceId, destinationId}` pair; either side may be a bare
/// data-element ID or a compound `dataElementId.categoryOptionComboId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub source_id: String,
    pub destination_id: String,
}

impl IdMapping {
    pub fn is_compound(&self) -> bool {
        self.source_id.contains('.') && self.destination_id.contains('.')
    }
}

/// Fans each produced value across the combos of one category option
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeComboSelector {
    pub attribute_id: String,
    pub category_option_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItemConfig {
    pub id: String,
    pub period_type: PeriodType,
    pub parent_org_unit: String,
    pub org_unit_level: u32,
    pub mappings: Vec<IdMapping>,
    #[serde(default)]
    pub attribute_combo: Option<AttributeComboSelector>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    pub config_id: String,
    pub source: InstanceConfig,
    pub destination: InstanceConfig,
    pub data_items: Vec<DataItemConfig>,
    /// Dashboards/visualizations/maps exported from the portal, used when
    /// `metadataSource=flexiportal-config`
    #[serde(default)]
    pub portal_metadata: Option<serde_json::Value>,
}

impl MigrationConfig {
    pub fn data_item(&self, id: &str) -> Option<&DataItemConfig> {
        self.data_items.iter().find(|item| item.id == id)
    }
}

/// In-memory view over the configuration directory
#[derive(Debug, Default)]
pub struct ConfigStore {
    configs: HashMap<String, Arc<MigrationConfig>>,
}

impl ConfigStore {
    /// Load every `*.json` document in `dir`. Unreadable entries are
    /// skipped with a warning; a malformed document fails the load.
    pub fn load_dir(dir: &Path) -> Result<Self, StoreError> {
        let mut configs = HashMap::new();

        if !dir.exists() {
            warn!(path = %dir.display(), "config directory missing, store starts empty");
            return Ok(Self { configs });
        }

        let entries = std::fs::read_dir(dir).map_err(|source| StoreError::ReadDir {
            path: dir.display().to_string(),
            source,
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };

            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let raw = std::fs::read_to_string(&path).map_err(|source| StoreError::ReadFile {
                path: path.display().to_string(),
                source,
            })?;

            let config: MigrationConfig =
                serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
                    path: path.display().to_string(),
                    source,
                })?;

            if config.data_items.is_empty() {
                return Err(StoreError::NoDataItems(config.config_id));
            }

            info!(
                config_id = %config.config_id,
                data_items = config.data_items.len(),
                "loaded migration config"
            );
            configs.insert(config.config_id.clone(), Arc::new(config));
        }

        Ok(Self { configs })
    }

    /// Build a store directly from configs, bypassing the filesystem.
    pub fn from_configs(configs: Vec<MigrationConfig>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|config| (config.config_id.clone(), Arc::new(config)))
                .collect(),
        }
    }

    pub fn get(&self, config_id: &str) -> Option<Arc<MigrationConfig>> {
        self.configs.get(config_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_config_json(config_id: &str) -> String {
        format!(
            r#"{{
              "configId": "{config_id}",
              "source": {{
                "baseUrl": "https://source.example.org",
                "username": "sync",
                "password": "secret",
                "routeId": "source-route"
              }},
              "destination": {{
                "baseUrl": "https://dest.example.org",
                "username": "sync",
                "password": "secret"
              }},
              "dataItems": [
                {{
                  "id": "item-1",
                  "periodType": "MONTHLY",
                  "parentOrgUnit": "OU_ROOT",
                  "orgUnitLevel": 3,
                  "mappings": [
                    {{"sourceId": "DE_A", "destinationId": "DE_B"}}
                  ]
                }}
              ]
            }}"#
        )
    }

    #[test]
    fn loads_json_documents() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cfg1.json"), sample_config_json("cfg1")).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let store = ConfigStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 1);

        let config = store.get("cfg1").unwrap();
        assert_eq!(config.source.route_id.as_deref(), Some("source-route"));
        assert_eq!(config.data_items[0].period_type, PeriodType::Monthly);
        assert!(store.get("unknown").is_none());
    }

    #[test]
    fn missing_directory_is_empty_store() {
        let store = ConfigStore::load_dir(Path::new("/nonexistent/configs")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn rejects_config_without_data_items() {
        let dir = TempDir::new().unwrap();
        let raw = r#"{
          "configId": "cfg2",
          "source": {"baseUrl": "https://s", "username": "u", "password": "p"},
          "destination": {"baseUrl": "https://d", "username": "u", "password": "p"},
          "dataItems": []
        }"#;
        fs::write(dir.path().join("cfg2.json"), raw).unwrap();

        let result = ConfigStore::load_dir(dir.path());
        assert!(matches!(result, Err(StoreError::NoDataItems(_))));
    }

    #[test]
    fn ids_are_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.json"), sample_config_json("cfg-b")).unwrap();
        fs::write(dir.path().join("a.json"), sample_config_json("cfg-a")).unwrap();

        let store = ConfigStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.ids(), vec!["cfg-a".to_string(), "cfg-b".to_string()]);
    }
}
