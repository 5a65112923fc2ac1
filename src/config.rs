#![allow(dead_code)]
//! Tree action configuration.
//!
//! Process settings come from the environment; tree actions are loaded from
//! the `configs/` directory, one JSON document per action.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::ConfigError;
use crate::rows::{Condition, RowSource};

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub config_dir: PathBuf,
    pub data_file: PathBuf,
}

impl ServerSettings {
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Self {
            bind_addr: var("TREE_BIND_ADDR", "0.0.0.0:3000"),
            config_dir: PathBuf::from(var("TREE_CONFIG_DIR", "configs")),
            data_file: PathBuf::from(var("TREE_DATA_FILE", "data/store.json")),
        }
    }
}

/// A setting that is either a literal or computed when a build starts.
///
/// JSON configs always produce `Value`; `Computed` is for actions registered
/// from code.
#[derive(Clone)]
pub enum Deferred<T> {
    Value(T),
    Computed(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Deferred<T> {
    pub fn computed(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    pub fn resolve(&self) -> T {
        match self {
            Self::Value(v) => v.clone(),
            Self::Computed(f) => f(),
        }
    }
}

impl<T: Default> Default for Deferred<T> {
    fn default() -> Self {
        Self::Value(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Deferred<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self::Value)
    }
}

impl<T: Serialize + Clone> Serialize for Deferred<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.resolve().serialize(serializer)
    }
}

/// One tree action: which entity to flatten and how rows map to tree items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeActionConfig {
    pub name: String,
    /// Entity collection in the row source.
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Dotted paths reach into eager-loaded relations.
    #[serde(default = "default_label_field")]
    pub label_field: String,
    #[serde(default = "default_parent_field")]
    pub parent_field: String,
    #[serde(default = "default_icon_field")]
    pub icon_field: String,
    /// Copied into `a_attr.data-type`.
    #[serde(default)]
    pub type_field: Option<String>,
    /// Copied into the item's `type`.
    #[serde(default)]
    pub vary_by_type_field: Option<String>,
    #[serde(default = "default_sort_field")]
    pub sort_field: String,
    #[serde(default = "default_query_parent_param")]
    pub query_parent_param: String,
    #[serde(default = "default_query_selected_param")]
    pub query_selected_param: String,
    #[serde(default)]
    pub with_relations: Deferred<Vec<String>>,
    #[serde(default)]
    pub where_condition: Deferred<Condition>,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_true")]
    pub recursive_parents: bool,
    /// Cache key prefix. Must differ between actions that share an entity
    /// but use different conditions.
    #[serde(default = "default_cache_key")]
    pub cache_key: Deferred<String>,
    /// Seconds.
    #[serde(default = "default_cache_lifetime")]
    pub cache_lifetime: u64,
    /// Icon name -> css class, e.g. `{"default": "fa fa-file", "dir": "fa fa-folder-o"}`.
    #[serde(default)]
    pub icons: Option<HashMap<String, String>>,
    /// Extra client options merged into the picker configuration.
    #[serde(default)]
    pub picker: serde_json::Value,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_label_field() -> String {
    "name".to_string()
}

fn default_parent_field() -> String {
    "parent_id".to_string()
}

fn default_icon_field() -> String {
    "icon".to_string()
}

fn default_sort_field() -> String {
    "sort_order".to_string()
}

fn default_query_parent_param() -> String {
    "id".to_string()
}

fn default_query_selected_param() -> String {
    "selected_id".to_string()
}

fn default_cache_key() -> Deferred<String> {
    Deferred::Value("FullTree".to_string())
}

fn default_cache_lifetime() -> u64 {
    86400
}

fn default_true() -> bool {
    true
}

impl TreeActionConfig {
    /// A config with every default applied.
    pub fn new(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: Some(entity.into()),
            id_field: default_id_field(),
            label_field: default_label_field(),
            parent_field: default_parent_field(),
            icon_field: default_icon_field(),
            type_field: None,
            vary_by_type_field: None,
            sort_field: default_sort_field(),
            query_parent_param: default_query_parent_param(),
            query_selected_param: default_query_selected_param(),
            with_relations: Deferred::default(),
            where_condition: Deferred::default(),
            cache_enabled: true,
            recursive_parents: true,
            cache_key: default_cache_key(),
            cache_lifetime: default_cache_lifetime(),
            icons: None,
            picker: serde_json::Value::Null,
        }
    }

    /// Check the action against the row source. Returns the entity name.
    pub fn validate(&self, source: &dyn RowSource) -> Result<&str, ConfigError> {
        let entity = match self.entity.as_deref() {
            Some(e) if !e.is_empty() => e,
            _ => return Err(ConfigError::MissingEntity(self.name.clone())),
        };
        if !source.has_entity(entity) {
            return Err(ConfigError::UnknownEntity {
                action: self.name.clone(),
                entity: entity.to_string(),
            });
        }

        for (field, value) in [
            ("id_field", &self.id_field),
            ("label_field", &self.label_field),
            ("parent_field", &self.parent_field),
            ("sort_field", &self.sort_field),
        ] {
            if value.is_empty() {
                return Err(ConfigError::EmptyField {
                    action: self.name.clone(),
                    field,
                });
            }
        }

        if self.cache_enabled {
            let representable = Instant::now()
                .checked_add(Duration::from_secs(self.cache_lifetime))
                .is_some();
            if self.cache_lifetime == 0 || !representable {
                return Err(ConfigError::InvalidCacheLifetime {
                    action: self.name.clone(),
                    seconds: self.cache_lifetime,
                });
            }
        }

        if let Some(icons) = &self.icons {
            if !icons.contains_key("default") {
                return Err(ConfigError::MissingDefaultIcon(self.name.clone()));
            }
        }

        Ok(entity)
    }
}

/// Tree actions indexed by name.
#[derive(Debug, Default)]
pub struct ConfigStore {
    actions: HashMap<String, TreeActionConfig>,
}

impl ConfigStore {
    /// Load all action configs from the specified directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut actions = HashMap::new();

        if !dir.exists() {
            anyhow::bail!("Config directory does not exist: {:?}", dir);
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {:?}", path))?;

                let config: TreeActionConfig = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {:?}", path))?;

                info!("Loaded tree action: {} from {:?}", config.name, path);
                actions.insert(config.name.clone(), config);
            }
        }

        if actions.is_empty() {
            anyhow::bail!("No tree actions found in {:?}", dir);
        }

        Ok(Self { actions })
    }

    /// Create a store from configs built in code.
    pub fn from_configs(configs: Vec<TreeActionConfig>) -> Result<Self> {
        if configs.is_empty() {
            anyhow::bail!("No tree actions provided");
        }

        Ok(Self {
            actions: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&TreeActionConfig> {
        self.actions.get(name)
    }

    /// Action names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all configs as a Vec.
    pub fn all(&self) -> Vec<TreeActionConfig> {
        self.actions.values().cloned().collect()
    }
}
