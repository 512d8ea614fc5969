//! On-disk settings: entity definitions, parser options and the connection.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::criteria::{EntityDefinition, QueryComposer, StaticMetadata, DEFAULT_RESERVED_KEY};
use crate::db::ConnectionConfig;
use crate::persister::{Persister, ResultCasing};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Criteria key holding an embedded base query.
    pub reserved_key: String,
    pub result_casing: ResultCasing,
    #[serde(rename = "entity")]
    pub entities: Vec<EntityDefinition>,
    pub connection: ConnectionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reserved_key: DEFAULT_RESERVED_KEY.to_string(),
            result_casing: ResultCasing::default(),
            entities: Vec::new(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Settings {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pgcriteria")
            .join("config.toml")
    }

    /// Load from `path`, or from the default location. A missing default file
    /// yields default settings; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::config_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn metadata(&self) -> StaticMetadata {
        self.entities.iter().cloned().collect()
    }

    /// A persister for `entity` over this configuration's metadata.
    pub fn persister(&self, entity: &str) -> Result<Arc<Persister>> {
        if !self.entities.iter().any(|e| e.name == entity) {
            let known: Vec<&str> = self.entities.iter().map(|e| e.name.as_str()).collect();
            anyhow::bail!("unknown entity {:?} (configured: {})", entity, known.join(", "));
        }
        Ok(Arc::new(
            Persister::new(Arc::new(self.metadata()), entity).with_casing(self.result_casing),
        ))
    }

    pub fn composer(&self, persister: Arc<Persister>) -> QueryComposer {
        QueryComposer::new(persister).with_reserved_key(self.reserved_key.clone())
    }
}
